pub mod batch;
pub mod categories;
pub mod cleaner;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod fetch;
pub mod html;
pub mod images;
pub mod record;
pub mod rest;
pub mod rules;
pub mod runtime;
pub mod sqlite;
pub mod store;
