//! Configuration section definitions.
//!
//! | Module   | TOML Section | Purpose                                 |
//! |----------|--------------|-----------------------------------------|
//! | `build`  | `[build]`    | Builder command, sources, scan timing   |
//! | `events` | `[events]`   | Observable tick, stream keep-alive      |
//! | `serve`  | `[serve]`    | HTTP server and shutdown policy         |
//! | `store`  | `[store]`    | SQLite location and polling fallback    |

mod build;
mod events;
mod serve;
mod store;

pub use build::{BuildConfig, DEFAULT_EXCLUDE};
pub use events::EventsConfig;
pub use serve::ServeConfig;
pub use store::StoreConfig;
