pub mod chart;
pub mod constants;
pub mod content_types;
pub mod journal;
pub mod package;
pub mod rels;
pub mod scan;
pub mod session;
pub mod splice;
pub mod xml;
