pub mod codec;
pub mod session;
pub mod signature;

pub use codec::{ClientFrame, ServerFrame};
pub use session::{SessionCredentials, SessionHandle, SessionManager};
pub use signature::sign;
