/// Text and photo relay flows
pub mod chat;
/// Teloxide endpoints and user-facing replies
pub mod handlers;
/// Sending long Markdown replies
pub mod messaging;
/// Phone-verified registration flows
pub mod registration;
