pub mod ids;
pub mod ctx;
pub mod message;
pub mod state;
pub mod events;

pub use ids::{JobId, ConsumerTag};
pub use ctx::HandlerCtx;
pub use message::{Delivery, Envelope, FieldArgs, FieldValue, DEFAULT_CONTENT_TYPE, DELAY_HEADER};
pub use state::JobState;
pub use events::SupervisorEvent;
