pub mod aggregates;
pub mod events;
pub mod publisher;
pub mod value_objects;

// Re-export commonly used types
pub use aggregates::User;
pub use events::{EventName, UserEvent};
pub use publisher::{CapturingSink, EventPublisher, EventSink, Pending, PublishError};
pub use value_objects::{SocialAccount, SocialId, SocialProvider, Status, UserId};
