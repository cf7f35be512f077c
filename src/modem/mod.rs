// Modem-mediated HTTP(S): an AT command/response driver layered on the
// modem's byte stream, plus the session client built on top of it.

pub mod channel;
pub mod http;

pub use channel::CommandChannel;
pub use http::ModemHttpClient;
