pub mod capture;
pub mod classify;
pub mod config;
pub mod correlator;
pub mod event;
pub mod export;
pub mod filter;
pub mod logging;
pub mod path_builder;
pub mod save_files;
pub mod session;
pub mod storage;
