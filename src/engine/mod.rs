pub mod controller;
pub mod entities;
pub mod environment;
pub mod operations;
pub mod path;
pub mod registry;
pub mod xml;
