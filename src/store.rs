use crate::{
    Error, Result,
    documents::PgCollection,
    driver::{CollectionDriver, CollectionSettings, CollectionSource, ReadConcern},
    schema::{SEARCH_CATALOG, SchemaConfig, SchemaManager},
    search::{PgSearchAdmin, SYNONYMS_COLLECTION, SearchIndexManager},
    session::SessionHandle,
};
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use std::str::FromStr;
use std::{collections::BTreeSet, sync::Arc, time::Duration};

/// Entry point: connection pools plus the registry of known collections.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    replica: Option<PgPool>,
    schema: String,
    collections: Arc<BTreeSet<String>>,
    defaults: CollectionSettings,
    synonyms_collection: String,
}

impl Store {
    /// Connect with defaults: `public` schema, no collections registered.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::builder(url).build().await
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema_name(&self) -> &str {
        &self.schema
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(String::as_str)
    }

    pub fn default_settings(&self) -> CollectionSettings {
        self.defaults
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    /// Every registered collection plus the synonym corpus.
    pub fn schema_config(&self) -> SchemaConfig {
        let mut config = SchemaConfig::new(&self.schema);
        for name in self.collections.iter() {
            config = config.collection(name);
        }
        if !self.collections.contains(&self.synonyms_collection) {
            config = config.collection(&self.synonyms_collection);
        }
        config
    }

    pub fn search(&self) -> SearchIndexManager {
        SearchIndexManager::new(
            Arc::new(PgSearchAdmin::new(self.pool.clone(), &self.schema)),
            Arc::new(self.clone()),
        )
        .with_synonyms_collection(&self.synonyms_collection)
    }

    /// Start a unit of work. The caller owns the handle and must commit or
    /// abort it; collections only borrow it.
    pub async fn begin_session(&self) -> Result<SessionHandle> {
        self.begin_session_with(ReadConcern::Committed).await
    }

    pub async fn begin_session_with(&self, read_concern: ReadConcern) -> Result<SessionHandle> {
        let mut tx = self.pool.begin().await?;
        if read_concern == ReadConcern::Snapshot {
            sqlx::query("set transaction isolation level repeatable read")
                .execute(&mut *tx)
                .await?;
        }
        let session = SessionHandle::from_transaction(tx);
        tracing::debug!(target: "kennel::session", session = %session.id(), ?read_concern, "session started");
        Ok(session)
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }
}

impl CollectionSource for Store {
    fn driver(&self, collection: &str) -> Result<Arc<dyn CollectionDriver>> {
        if !self.collections.contains(collection) && collection != self.synonyms_collection {
            return Err(Error::configuration(format!(
                "collection `{collection}` is not registered"
            )));
        }
        Ok(Arc::new(PgCollection::new(
            self.pool.clone(),
            self.replica.clone(),
            &self.schema,
            collection,
            self.defaults,
        )))
    }
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 55
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && !name.ends_with("__changes")
        && !(kind == "collection" && name == SEARCH_CATALOG);
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!("`{name}` is not a valid {kind} name")))
    }
}

pub struct StoreBuilder {
    url: String,
    schema: String,
    max_connections: Option<u32>,
    connect_timeout: Option<Duration>,
    replica_url: Option<String>,
    collections: BTreeSet<String>,
    defaults: CollectionSettings,
    synonyms_collection: String,
    prepared_statement_cache_size: Option<usize>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: "public".to_string(),
            max_connections: None,
            connect_timeout: None,
            replica_url: None,
            collections: BTreeSet::new(),
            defaults: CollectionSettings::default(),
            synonyms_collection: SYNONYMS_COLLECTION.to_string(),
            prepared_statement_cache_size: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Read replica for collections configured with [`crate::ReadPreference::Replica`].
    pub fn replica_url(mut self, url: impl Into<String>) -> Self {
        self.replica_url = Some(url.into());
        self
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.insert(name.into());
        self
    }

    pub fn collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn default_settings(mut self, settings: CollectionSettings) -> Self {
        self.defaults = settings;
        self
    }

    pub fn synonyms_collection(mut self, name: impl Into<String>) -> Self {
        self.synonyms_collection = name.into();
        self
    }

    /// Hint for prepared statement cache size. Actual behavior depends on driver.
    pub fn prepared_statement_cache_size(mut self, size: usize) -> Self {
        self.prepared_statement_cache_size = Some(size.max(1));
        self
    }

    fn pool_options(&self) -> PgPoolOptions {
        let mut opts = PgPoolOptions::new();
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.connect_timeout {
            opts = opts.acquire_timeout(t);
        }
        opts
    }

    fn connect_options(&self, url: &str) -> Result<PgConnectOptions> {
        let mut connect_opts =
            PgConnectOptions::from_str(url).map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
        if let Some(cap) = self.prepared_statement_cache_size {
            connect_opts = connect_opts.statement_cache_capacity(cap);
        }
        Ok(connect_opts)
    }

    pub async fn build(self) -> Result<Store> {
        check_identifier("schema", &self.schema)?;
        check_identifier("collection", &self.synonyms_collection)?;
        for name in &self.collections {
            check_identifier("collection", name)?;
        }

        let pool = self
            .pool_options()
            .connect_with(self.connect_options(&self.url)?)
            .await?;
        let replica = match &self.replica_url {
            Some(url) => Some(
                self.pool_options()
                    .connect_with(self.connect_options(url)?)
                    .await?,
            ),
            None => None,
        };
        tracing::debug!(
            target: "kennel::store",
            schema = %self.schema,
            collections = self.collections.len(),
            replica = replica.is_some(),
            "store connected"
        );
        Ok(Store {
            pool,
            replica,
            schema: self.schema,
            collections: Arc::new(self.collections),
            defaults: self.defaults,
            synonyms_collection: self.synonyms_collection,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_checked() {
        assert!(check_identifier("collection", "pets").is_ok());
        assert!(check_identifier("collection", "adoption_requests").is_ok());
        assert!(check_identifier("collection", "").is_err());
        assert!(check_identifier("collection", "pets;drop").is_err());
        assert!(check_identifier("collection", "1pets").is_err());
        assert!(check_identifier("collection", "pets__changes").is_err());
        assert!(check_identifier("collection", "kennel_search_indexes").is_err());
        assert!(check_identifier("schema", "kennel_search_indexes").is_ok());
    }

    #[tokio::test]
    async fn invalid_registrations_fail_before_connecting() {
        let err = Store::builder("postgres://localhost/none")
            .collection("bad name")
            .build()
            .await
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }
}
