//! Storage layer for user registrations and relay history
//!
//! Provides the [`UserStore`] interface and its MongoDB implementation.

use crate::config::{
    get_registration_cache_ttl_secs, MONGODB_MAX_POOL_SIZE, MONGODB_TIMEOUT_SECS,
    REGISTRATION_CACHE_CAPACITY,
};
use async_trait::async_trait;
use moka::future::Cache;
use mongodb::bson::{doc, DateTime};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Collection of registered and pending users
pub const USERS_COLLECTION: &str = "users";
/// Collection of text exchanges
pub const MESSAGES_COLLECTION: &str = "messages";
/// Collection of image analyses
pub const FILES_COLLECTION: &str = "files";

const DUPLICATE_KEY_CODE: i32 = 11000;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Error reported by the MongoDB driver
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),
    /// A unique index rejected the write
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    /// Configuration error (missing URI, etc.)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether a unique index rejected the write
    #[must_use]
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::DuplicateKey(_) => true,
            Self::Mongo(e) => is_duplicate_key_error(e),
            Self::Config(_) => false,
        }
    }
}

fn is_duplicate_key_error(error: &mongodb::error::Error) -> bool {
    matches!(
        error.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY_CODE
    )
}

/// A user known to the bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Telegram chat id; unique
    pub chat_id: i64,
    /// Whether the user completed phone verification
    pub registered: bool,
    /// Telegram first name
    pub first_name: String,
    /// Telegram @username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Verified phone number, set at registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// First `/start`
    pub created_at: DateTime,
    /// Last start, registration or chat
    pub last_interaction: DateTime,
}

impl UserRecord {
    /// A freshly started, not yet verified user
    #[must_use]
    pub fn pending(chat_id: i64, first_name: impl Into<String>, username: Option<String>) -> Self {
        let now = DateTime::now();
        Self {
            chat_id,
            registered: false,
            first_name: first_name.into(),
            username,
            phone_number: None,
            created_at: now,
            last_interaction: now,
        }
    }
}

/// Result of analyzing one photo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysisRecord {
    /// Chat the photo came from
    pub user_id: i64,
    /// Telegram file id of the analyzed photo size
    pub file_id: String,
    /// Model output
    pub analysis: String,
    /// When the analysis finished
    pub timestamp: DateTime,
}

/// One prompt and the reply it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatExchangeRecord {
    /// Chat the prompt came from
    pub chat_id: i64,
    /// User text
    pub prompt: String,
    /// Model reply
    pub response: String,
    /// When the reply was produced
    pub timestamp: DateTime,
}

/// Interface for storage providers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a user by chat id
    async fn find_user(&self, chat_id: i64) -> Result<Option<UserRecord>, StorageError>;
    /// Insert a new user
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StorageError>;
    /// Store the verified phone and mark the user registered.
    ///
    /// Returns `true` if exactly one user document was modified.
    async fn complete_registration(
        &self,
        chat_id: i64,
        phone_number: &str,
    ) -> Result<bool, StorageError>;
    /// Whether the chat belongs to a registered user
    async fn is_registered(&self, chat_id: i64) -> Result<bool, StorageError>;
    /// Bump `last_interaction` to now
    async fn touch_interaction(&self, chat_id: i64) -> Result<(), StorageError>;
    /// Save an image analysis
    async fn save_image_analysis(&self, record: &ImageAnalysisRecord)
        -> Result<(), StorageError>;
    /// Save a text exchange
    async fn save_chat_exchange(&self, record: &ChatExchangeRecord) -> Result<(), StorageError>;
    /// Check connection to storage
    async fn check_connection(&self) -> Result<(), String>;
}

/// MongoDB-backed storage implementation
pub struct MongoStorage {
    client: Client,
    users: Collection<UserRecord>,
    messages: Collection<ChatExchangeRecord>,
    files: Collection<ImageAnalysisRecord>,
    /// Chat ids confirmed registered; registration is never revoked
    registered: Cache<i64, ()>,
}

impl MongoStorage {
    /// Connect to MongoDB and prepare the collections
    ///
    /// # Errors
    ///
    /// Returns an error if the URI is invalid or index creation fails.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StorageError> {
        if uri.trim().is_empty() {
            return Err(StorageError::Config("MONGODB_URI is empty".into()));
        }

        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.max_pool_size = Some(MONGODB_MAX_POOL_SIZE);
        options.connect_timeout = Some(Duration::from_secs(MONGODB_TIMEOUT_SECS));
        options.server_selection_timeout = Some(Duration::from_secs(MONGODB_TIMEOUT_SECS));

        let client = Client::with_options(options)?;
        let db = client.database(database);

        let storage = Self {
            users: db.collection(USERS_COLLECTION),
            messages: db.collection(MESSAGES_COLLECTION),
            files: db.collection(FILES_COLLECTION),
            registered: Cache::builder()
                .max_capacity(REGISTRATION_CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(get_registration_cache_ttl_secs()))
                .build(),
            client,
        };
        storage.ensure_indexes().await?;
        info!(database, "MongoDB storage initialized.");
        Ok(storage)
    }

    /// Remove a user and forget its cached registration.
    ///
    /// Returns `true` if a document was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_user(&self, chat_id: i64) -> Result<bool, StorageError> {
        let result = self.users.delete_one(doc! { "chat_id": chat_id }).await?;
        self.registered.invalidate(&chat_id).await;
        Ok(result.deleted_count == 1)
    }

    async fn ensure_indexes(&self) -> Result<(), StorageError> {
        let chat_id_unique = IndexModel::builder()
            .keys(doc! { "chat_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.users.create_index(chat_id_unique).await?;

        let files_by_user = IndexModel::builder()
            .keys(doc! { "user_id": 1, "timestamp": -1 })
            .build();
        self.files.create_index(files_by_user).await?;

        let messages_by_chat = IndexModel::builder()
            .keys(doc! { "chat_id": 1, "timestamp": -1 })
            .build();
        self.messages.create_index(messages_by_chat).await?;

        debug!("MongoDB indexes ready");
        Ok(())
    }
}

#[async_trait]
impl UserStore for MongoStorage {
    async fn find_user(&self, chat_id: i64) -> Result<Option<UserRecord>, StorageError> {
        Ok(self.users.find_one(doc! { "chat_id": chat_id }).await?)
    }

    #[instrument(skip_all, fields(chat_id = user.chat_id))]
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StorageError> {
        match self.users.insert_one(user).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key_error(&e) => Err(StorageError::DuplicateKey(format!(
                "user {} already exists",
                user.chat_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, phone_number))]
    async fn complete_registration(
        &self,
        chat_id: i64,
        phone_number: &str,
    ) -> Result<bool, StorageError> {
        let update = doc! {
            "$set": {
                "phone_number": phone_number,
                "registered": true,
                "last_interaction": DateTime::now(),
            }
        };
        let result = self
            .users
            .update_one(doc! { "chat_id": chat_id }, update)
            .await?;

        let modified = result.modified_count == 1;
        if modified {
            self.registered.insert(chat_id, ()).await;
        }
        Ok(modified)
    }

    async fn is_registered(&self, chat_id: i64) -> Result<bool, StorageError> {
        if self.registered.contains_key(&chat_id) {
            return Ok(true);
        }
        let found = self
            .users
            .find_one(doc! { "chat_id": chat_id, "registered": true })
            .await?
            .is_some();
        if found {
            self.registered.insert(chat_id, ()).await;
        }
        Ok(found)
    }

    async fn touch_interaction(&self, chat_id: i64) -> Result<(), StorageError> {
        self.users
            .update_one(
                doc! { "chat_id": chat_id },
                doc! { "$set": { "last_interaction": DateTime::now() } },
            )
            .await?;
        Ok(())
    }

    async fn save_image_analysis(
        &self,
        record: &ImageAnalysisRecord,
    ) -> Result<(), StorageError> {
        self.files.insert_one(record).await?;
        Ok(())
    }

    async fn save_chat_exchange(&self, record: &ChatExchangeRecord) -> Result<(), StorageError> {
        self.messages.insert_one(record).await?;
        Ok(())
    }

    async fn check_connection(&self) -> Result<(), String> {
        match self
            .client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
        {
            Ok(_) => {
                info!("MongoDB connection successful");
                Ok(())
            }
            Err(e) => Err(format!("MongoDB ping failed: {e}")),
        }
    }
}
