//! Cargo features baked in at compile time, generated by `build.rs`.

include!(concat!(env!("OUT_DIR"), "/compiled_features.rs"));
