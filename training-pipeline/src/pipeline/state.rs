use state_machines::state_machine;

state_machine! {
    name: TrainingMachine,
    state: TrainingState,
    initial: Ready,
    states: [Ready, DataLoaded, DataSplit, ModelConfigured, ModelFitted, EpochsSimulated, Finalized, Failed],
    events {
        load { transition: { from: Ready, to: DataLoaded } }
        split { transition: { from: DataLoaded, to: DataSplit } }
        configure { transition: { from: DataSplit, to: ModelConfigured } }
        fit { transition: { from: ModelConfigured, to: ModelFitted } }
        simulate { transition: { from: ModelFitted, to: EpochsSimulated } }
        finalize { transition: { from: EpochsSimulated, to: Finalized } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: DataLoaded, to: Failed }
            transition: { from: DataSplit, to: Failed }
            transition: { from: ModelConfigured, to: Failed }
            transition: { from: ModelFitted, to: Failed }
            transition: { from: EpochsSimulated, to: Failed }
        }
    }
}

pub fn ready() -> TrainingMachine<(), Ready> {
    TrainingMachine::new(())
}
