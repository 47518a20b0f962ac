use crate::error::AppError;

use super::types::StoredObject;
use futures::Stream;
use std::sync::{PoisonError, RwLock};
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Notification, Surreal,
};
use tracing::{info, warn};

/// Everything needed to (re)open a connection.
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub address: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
}

/// Owned handle to the shared store. Constructed once per process and passed
/// to every component that needs it; `reconnect` swaps in a fresh connection
/// built from the original settings.
pub struct SurrealDbClient {
    client: RwLock<Surreal<Any>>,
    settings: Option<ConnectionSettings>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    /// * `address` - Endpoint, e.g. `ws://localhost:8000` or `rocksdb://data/db`
    /// * `username`, `password` - Root credentials
    /// * `namespace`, `database` - Namespace and database to select
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let settings = ConnectionSettings {
            address: address.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            namespace: namespace.to_string(),
            database: database.to_string(),
        };
        let client = Self::open(&settings).await?;

        // A fresh `mem://` engine would be an empty store, so embedded
        // clients keep the connection they were born with.
        let settings = (!Self::is_embedded_memory(address)).then_some(settings);

        Ok(SurrealDbClient {
            client: RwLock::new(client),
            settings,
        })
    }

    fn is_embedded_memory(address: &str) -> bool {
        address.starts_with("mem://")
    }

    async fn open(settings: &ConnectionSettings) -> Result<Surreal<Any>, Error> {
        let db = connect(settings.address.as_str()).await?;

        // Embedded memory engines have no users to sign in as
        if !Self::is_embedded_memory(&settings.address) {
            db.signin(Root {
                username: &settings.username,
                password: &settings.password,
            })
            .await?;
        }

        db.use_ns(settings.namespace.as_str())
            .use_db(settings.database.as_str())
            .await?;

        Ok(db)
    }

    /// Current connection. Cheap to clone; callers should not hold on to it
    /// across a reconnect.
    pub fn handle(&self) -> Surreal<Any> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuilds the connection from the stored settings. In-memory clients
    /// keep their connection, and with it their data.
    pub async fn reconnect(&self) -> Result<(), AppError> {
        let Some(settings) = &self.settings else {
            return Ok(());
        };

        warn!(address = %settings.address, "reconnecting to SurrealDB");
        let fresh = Self::open(settings).await?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        info!(address = %settings.address, "SurrealDB connection re-established");

        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.handle().query("RETURN true").await?.check()?;
        Ok(())
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.handle()
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_training_task_state ON training_task FIELDS state;
                 DEFINE INDEX IF NOT EXISTS idx_training_task_scheduled ON training_task FIELDS scheduled_at;
                 DEFINE INDEX IF NOT EXISTS idx_job_status_expiry ON job_status FIELDS expires_at;
                 DEFINE INDEX IF NOT EXISTS idx_job_event_job ON job_event FIELDS job_id;",
            )
            .await?
            .check()?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.handle()
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.handle().select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.handle().delete((T::table_name(), id)).await
    }

    /// Operation to listen to a table for updates, requires the struct to implement StoredObject
    ///
    /// # Returns
    /// * A live stream of notifications; dropping it kills the live query
    pub async fn listen<T>(
        &self,
    ) -> Result<impl Stream<Item = Result<Notification<T>, Error>>, Error>
    where
        T: for<'de> StoredObject + std::marker::Unpin,
    {
        self.handle().select(T::table_name()).live().await
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient {
            client: RwLock::new(db),
            settings: None,
        })
    }

    /// A client that was never connected; every operation fails as if the
    /// store were unreachable.
    pub fn disconnected() -> Self {
        SurrealDbClient {
            client: RwLock::new(Surreal::init()),
            settings: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string(); // ensures isolation per test run
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized()
            .await
            .expect("Failed to initialize schema");
        // Index definitions are idempotent
        db.ensure_initialized()
            .await
            .expect("Failed to re-run initialization");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_health_check_and_reconnect() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.health_check().await.expect("memory db should be healthy");
        // In-memory clients have no settings, reconnect keeps the same data
        db.reconnect().await.expect("reconnect is a no-op");
        db.health_check().await.expect("still healthy");
    }

    #[tokio::test]
    async fn test_reconnect_keeps_configured_memory_store() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::new("mem://", "", "", "test_ns", &database)
            .await
            .expect("Failed to open configured memory store");

        let dummy = Dummy {
            id: "kept".to_string(),
            name: "survives reconnect".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        db.store_item(dummy.clone()).await.expect("Failed to store");

        db.reconnect().await.expect("reconnect");

        let fetched = db.get_item::<Dummy>("kept").await.expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy));
    }

    #[tokio::test]
    async fn test_disconnected_client_reports_errors() {
        let db = SurrealDbClient::disconnected();

        assert!(db.health_check().await.is_err());
        assert!(db.get_item::<Dummy>("abc").await.is_err());
    }
}
