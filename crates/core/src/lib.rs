pub mod controller;
pub mod device;
pub mod error;
pub mod media;
pub mod session;
pub mod talkback;
pub mod transport;

pub use controller::{StreamController, StreamingConfig};
pub use device::{Device, DeviceCapabilities, IntercomInput, MediaSource, PlatformSession, StreamOptions};
pub use error::{Result, StreamError};
pub use session::params::{
    AddressFamily, NegotiateRequest, NegotiateResponse, ReconfigureRequest, StartRequest, StreamRequest,
};
pub use session::{Session, SessionRegistry, SessionState};
pub use transport::{AddressSelector, KillSwitch, MediaTransport, PortAllocator, TransportContext, TransportHandle};
