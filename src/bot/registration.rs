//! Phone-verified registration.
//!
//! A user becomes known on `/start` and registered once they share their own
//! Telegram contact. The flows here only talk to [`UserStore`]; sending the
//! replies is left to the handlers.

use crate::storage::{StorageError, UserRecord, UserStore};
use tracing::{info, warn};

/// The parts of a Telegram sender the bot keeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramProfile {
    /// Private chat id, used as the user's identity
    pub chat_id: i64,
    /// Telegram first name
    pub first_name: String,
    /// Telegram @username
    pub username: Option<String>,
}

/// A contact card shared in the chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedContact {
    /// Phone number as Telegram delivered it
    pub phone_number: String,
    /// Telegram user the contact belongs to, if it is a Telegram account
    pub user_id: Option<i64>,
}

/// What `/start` found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// First contact; a pending record was created
    NewUser,
    /// Known user who has not shared a contact yet
    Incomplete,
    /// Known and verified
    AlreadyRegistered,
}

/// What a shared contact led to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    /// The phone was stored and the user is now registered
    Registered,
    /// No record changed (no pending user, or nothing new to store)
    NotUpdated,
    /// The contact belongs to someone other than the sender
    ForeignContact,
    /// The contact has no usable phone number
    InvalidPhone,
}

/// Handles `/start` for `profile`.
///
/// # Errors
///
/// Returns an error if the store cannot be read or written.
pub async fn start(
    store: &dyn UserStore,
    profile: &TelegramProfile,
) -> Result<StartOutcome, StorageError> {
    let chat_id = profile.chat_id;

    let Some(user) = store.find_user(chat_id).await? else {
        let record = UserRecord::pending(
            chat_id,
            profile.first_name.clone(),
            profile.username.clone(),
        );
        return match store.insert_user(&record).await {
            Ok(()) => {
                info!(chat_id, "New user started registration");
                Ok(StartOutcome::NewUser)
            }
            // A concurrent /start inserted the record first.
            Err(e) if e.is_duplicate_key() => Ok(StartOutcome::Incomplete),
            Err(e) => Err(e),
        };
    };

    store.touch_interaction(chat_id).await?;
    if user.registered {
        Ok(StartOutcome::AlreadyRegistered)
    } else {
        Ok(StartOutcome::Incomplete)
    }
}

/// Registers the phone from `contact` if it belongs to the sender.
///
/// # Errors
///
/// Returns an error if the store update fails.
pub async fn register_contact(
    store: &dyn UserStore,
    chat_id: i64,
    sender_id: i64,
    contact: &SharedContact,
) -> Result<ContactOutcome, StorageError> {
    if contact.user_id != Some(sender_id) {
        warn!(chat_id, sender_id, "Rejected contact of another user");
        return Ok(ContactOutcome::ForeignContact);
    }

    let Some(phone) = normalize_phone(&contact.phone_number) else {
        return Ok(ContactOutcome::InvalidPhone);
    };

    if store.complete_registration(chat_id, &phone).await? {
        info!(chat_id, "User registered");
        Ok(ContactOutcome::Registered)
    } else {
        Ok(ContactOutcome::NotUpdated)
    }
}

/// Whether `chat_id` may use the relay.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub async fn ensure_registered(store: &dyn UserStore, chat_id: i64) -> Result<bool, StorageError> {
    store.is_registered(chat_id).await
}

/// Strips separators from a phone number and ensures a leading `+`.
///
/// Returns `None` if no digits remain or anything other than digits is left.
#[must_use]
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '+' | '.'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{digits}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockUserStore;
    use mockall::predicate::eq;

    fn profile() -> TelegramProfile {
        TelegramProfile {
            chat_id: 42,
            first_name: "Ada".to_string(),
            username: Some("ada".to_string()),
        }
    }

    fn own_contact(phone: &str) -> SharedContact {
        SharedContact {
            phone_number: phone.to_string(),
            user_id: Some(42),
        }
    }

    #[tokio::test]
    async fn test_start_inserts_pending_user() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = MockUserStore::new();
        store
            .expect_find_user()
            .with(eq(42))
            .times(1)
            .returning(|_| Ok(None));
        store
            .expect_insert_user()
            .withf(|user| user.chat_id == 42 && !user.registered && user.phone_number.is_none())
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(start(&store, &profile()).await?, StartOutcome::NewUser);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_reports_incomplete_and_registered() -> Result<(), Box<dyn std::error::Error>>
    {
        let mut pending = MockUserStore::new();
        pending
            .expect_find_user()
            .returning(|_| Ok(Some(UserRecord::pending(42, "Ada", None))));
        pending.expect_touch_interaction().times(1).returning(|_| Ok(()));
        pending.expect_insert_user().never();
        assert_eq!(start(&pending, &profile()).await?, StartOutcome::Incomplete);

        let mut registered = MockUserStore::new();
        registered.expect_find_user().returning(|_| {
            let mut user = UserRecord::pending(42, "Ada", None);
            user.registered = true;
            user.phone_number = Some("+15550100".to_string());
            Ok(Some(user))
        });
        registered.expect_touch_interaction().returning(|_| Ok(()));
        assert_eq!(
            start(&registered, &profile()).await?,
            StartOutcome::AlreadyRegistered
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_start_losing_insert_race_is_incomplete() -> Result<(), Box<dyn std::error::Error>>
    {
        let mut store = MockUserStore::new();
        store.expect_find_user().times(1).returning(|_| Ok(None));
        store
            .expect_insert_user()
            .times(1)
            .returning(|_| Err(StorageError::DuplicateKey("user 42 already exists".into())));
        store.expect_touch_interaction().never();

        assert_eq!(start(&store, &profile()).await?, StartOutcome::Incomplete);
        Ok(())
    }

    #[tokio::test]
    async fn test_start_propagates_storage_errors() {
        let mut store = MockUserStore::new();
        store
            .expect_find_user()
            .returning(|_| Err(StorageError::Config("down".into())));

        assert!(matches!(
            start(&store, &profile()).await,
            Err(StorageError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_contact_registers_normalized_phone() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = MockUserStore::new();
        store
            .expect_complete_registration()
            .withf(|chat_id, phone| *chat_id == 42 && phone == "+15550100")
            .times(1)
            .returning(|_, _| Ok(true));

        let outcome = register_contact(&store, 42, 42, &own_contact("1 (555) 01-00")).await?;
        assert_eq!(outcome, ContactOutcome::Registered);
        Ok(())
    }

    #[tokio::test]
    async fn test_contact_not_updated_when_nothing_modified(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut store = MockUserStore::new();
        store
            .expect_complete_registration()
            .returning(|_, _| Ok(false));

        let outcome = register_contact(&store, 42, 42, &own_contact("+15550100")).await?;
        assert_eq!(outcome, ContactOutcome::NotUpdated);
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_contact_never_reaches_store() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = MockUserStore::new();
        store.expect_complete_registration().never();

        let someone_else = SharedContact {
            phone_number: "+15550199".to_string(),
            user_id: Some(7),
        };
        assert_eq!(
            register_contact(&store, 42, 42, &someone_else).await?,
            ContactOutcome::ForeignContact
        );

        let not_on_telegram = SharedContact {
            phone_number: "+15550199".to_string(),
            user_id: None,
        };
        assert_eq!(
            register_contact(&store, 42, 42, &not_on_telegram).await?,
            ContactOutcome::ForeignContact
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_contact_without_digits_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let mut store = MockUserStore::new();
        store.expect_complete_registration().never();

        assert_eq!(
            register_contact(&store, 42, 42, &own_contact(" - ")).await?,
            ContactOutcome::InvalidPhone
        );
        Ok(())
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 555-0100").as_deref(), Some("+15550100"));
        assert_eq!(normalize_phone("79001234567").as_deref(), Some("+79001234567"));
        assert_eq!(normalize_phone("(495) 123.45.67").as_deref(), Some("+4951234567"));
        assert_eq!(normalize_phone(""), None);
        assert_eq!(normalize_phone("call me"), None);
    }
}
