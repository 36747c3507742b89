#![deny(dead_code)]
#![deny(unused_imports)]
pub mod aggregate;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod fitter;
pub mod irls;
pub mod likelihood;
pub mod mcmc;
pub mod model;
pub mod optimize;
pub mod scaling;
pub mod simulate;
pub mod spec;
