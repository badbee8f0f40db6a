pub mod competences;
pub mod core;
pub mod exports;
pub mod modules;
pub mod seed;
