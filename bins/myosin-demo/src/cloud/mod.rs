//! Cloud side of the device shadow.

pub mod link;
