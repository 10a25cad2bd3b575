//! Generated gRPC bindings: the CTG stream surface served by the monitor
//! and the medical-records service it exports closed sessions to.

pub mod ctg {
    include!(concat!(env!("OUT_DIR"), "/ctg.rs"));
}

pub mod medical_records {
    include!(concat!(env!("OUT_DIR"), "/medical_records.rs"));
}
