pub mod config;
pub mod dbf;
pub mod error;
pub mod etl;
pub mod forecast;
pub mod io;
