//! HTTP surface
//!
//! The worker callback endpoint, the waveform read endpoint and the health
//! check. Everything else the application exposes (library CRUD, playlists,
//! settings) lives in front-end services, not here.

mod callbacks;
mod health;
mod waveforms;

pub use callbacks::callback_routes;
pub use health::health_routes;
pub use waveforms::waveform_routes;
