/// Service layer for identity-service
///
/// - Identity use cases (register, OTP activation, social sign-in, passkeys)
/// - Identity-provider verifiers (Google, LINE, passkeys)
/// - Projection handlers applying user events to the repository
/// - Event transports (Kafka, in-process channel)
pub mod identity;
pub mod inproc;
pub mod kafka_events;
pub mod oauth;
pub mod passkey;
pub mod projection;
pub mod verifier;

pub use identity::{IdentityService, SignInResponse};
pub use inproc::{ChannelSink, ProjectionWorker};
pub use kafka_events::{KafkaEventSink, KafkaProjectionConsumer, ProjectionConsumerConfig};
pub use oauth::{GoogleVerifier, LineAuthorization, LineAuthorizationUrl, LineLogin, LineVerifier};
pub use passkey::{PasskeyClient, PasskeysVerifier};
pub use projection::{ProjectionHandler, RetryConfig};
pub use verifier::{IdentityVerifier, VerifiedIdentity, VerifierRegistry, VerifyOptions};
