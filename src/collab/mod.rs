//! External collaborators consumed by this crate, expressed as plain
//! traits at the crate boundary.
//!
//! The spec treats `TransportProvider`, `SettingsStore`, and `EventBus`
//! as named external systems whose contract — not implementation — is
//! in scope. Each gets a trait here, a `web-sys`-backed implementation
//! for real browser embedding, and an in-memory fake for tests. This
//! mirrors the teacher crate's pattern of a `Wasm*`-prefixed concrete
//! type implementing a narrow Rust-level contract (`WasmTcpProvider`,
//! `WasmStorage`) rather than depending on a trait defined elsewhere.

mod event_bus;
mod settings_store;
mod transport_provider;

pub use event_bus::{EventBus, InMemoryEventBus, SubscriptionId};
pub use settings_store::{InMemorySettingsStore, SettingsStore};
#[cfg(target_arch = "wasm32")]
pub use settings_store::LocalStorageSettingsStore;
pub use transport_provider::{FakeTransportProvider, TransportEvent, TransportProvider, TransportStatus};
