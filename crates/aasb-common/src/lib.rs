//! ---
//! aasb_section: "01-core-functionality"
//! aasb_subsection: "module"
//! aasb_type: "source"
//! aasb_scope: "code"
//! aasb_description: "Shared configuration and tracing setup."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
//! Shared runtime plumbing for the AASB binaries: configuration loading and
//! tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, JournalConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, ResponderConfig,
};
pub use logging::{init_tracing, LogFormat};
