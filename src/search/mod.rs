pub mod constraint;
pub mod encoder;
pub mod hybrid;
pub mod qdrant;
pub mod sparse;
