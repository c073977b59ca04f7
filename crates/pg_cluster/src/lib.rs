pub mod api;
pub mod config;
pub mod controllers;
pub mod df;
pub mod intents;
pub mod strategies;
pub mod tasks;
pub mod util;
pub mod validation;
pub mod workflow;

#[cfg(test)]
pub mod tests;
