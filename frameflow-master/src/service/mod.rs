pub mod dag;
pub mod driver;
pub mod fault;
pub mod ingest;
pub mod master;
pub mod meta;
pub mod partition;
pub mod state;
