pub mod browser;
pub mod classify;
pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod dom;
pub mod eligibility;
pub mod environment;
pub mod error;
pub mod journal;
pub mod live;
pub mod messaging;
pub mod mutation;
pub mod observer;
pub mod replay;
pub mod scenario;
pub mod settings;
pub mod tracker;
pub mod transcript;
