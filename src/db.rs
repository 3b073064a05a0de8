use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Database, IndexModel};

pub struct MongoDB {
    pub client: Client,
    pub db: Database,
}

impl MongoDB {
    pub async fn init(uri: &str, db_name: &str) -> Self {
        let client_options = ClientOptions::parse(uri)
            .await
            .expect("Failed to parse MongoDB connection string");
        let client = Client::with_options(client_options).expect("Failed to initialize client");
        let db = client.database(db_name);
        MongoDB { client, db }
    }

    /// Unique indexes backing the pre-insert uniqueness checks.
    pub async fn ensure_indexes(&self) -> mongodb::error::Result<()> {
        let unique = IndexOptions::builder().unique(true).build();

        self.db
            .collection::<mongodb::bson::Document>("tours")
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "name": 1 })
                    .options(unique.clone())
                    .build(),
            )
            .await?;

        self.db
            .collection::<mongodb::bson::Document>("users")
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "email": 1 })
                    .options(unique)
                    .build(),
            )
            .await?;

        Ok(())
    }
}
