//! Production implementation of the `common::runtime::Runtime` trait.

mod prod;

pub use prod::ProdRuntime;

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    pub use common::runtime::testing::{
        TestDriver,
        TestRuntime,
    };
}
