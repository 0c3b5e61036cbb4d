//! API routes and handlers

mod router;
pub mod token;
pub mod voice;

pub use router::create_router;
