use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

/// Thin wrapper around the Surreal connection so the rest of the workspace
/// talks to one client type regardless of engine (in-memory for tests, any
/// `engine::any` address in production).
#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // The in-memory engine has no root credentials to sign in with.
        if address != "memory" {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// In-memory database, used by tests and local experimentation.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("memory").await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

impl std::ops::Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_client_accepts_queries() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        let mut response = db
            .client
            .query("RETURN 1 + 1")
            .await
            .expect("query failed");
        let value: Option<i64> = response.take(0).expect("failed to take result");
        assert_eq!(value, Some(2));
    }
}
