pub mod countries;
pub mod db;
pub mod geometry;
pub mod import;
pub mod kml;
pub mod language;
pub mod osm;

use std::sync::Once;

use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Logger, Root};

// Initialize only once to prevent integration tests from trying
// to allocate the logger/console multiple times when run in
// parallel.
static INIT: Once = Once::new();

pub fn init_logging(verbosity: u8) {
    INIT.call_once(|| {
        let log_level = match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };
        let stdout = ConsoleAppender::builder().build();
        let config = log4rs::Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .logger(Logger::builder().build("osm_boundary_import", log_level))
            .build(Root::builder().appender("stdout").build(LevelFilter::Off))
            .unwrap();
        let _handle = log4rs::init_config(config).unwrap();
    });
}
