pub mod openalpr;
pub mod stub;

pub use openalpr::{OpenAlprCli, OpenAlprConfig};
pub use stub::StubRecognizer;
