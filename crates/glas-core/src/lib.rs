//! The glas runtime core.
//!
//! A transactional coroutine engine over immutable tree-structured
//! data. Hosts create [`Glas`] threads, populate their namespaces with
//! primitives and definitions, drive data operations against stacks
//! and registers, and coordinate through optimistic commits.
//!
//! ```
//! let mut g = glas_core::init_thread().unwrap();
//! g.reg_fresh("r.").unwrap();
//! g.i64_push(7);
//! g.reg_set("r.x").unwrap();
//! assert!(g.commit());
//! g.reg_get("r.x").unwrap();
//! assert_eq!(g.i64_peek().unwrap(), 7);
//! ```

pub mod bits;
pub mod choice;
pub mod dict;
pub mod errors;
pub mod loader;
pub mod namespace;
pub mod prims;
pub mod refct;
pub mod registers;
pub mod rope;
pub mod shrub;
pub mod thread;
pub mod value;
pub mod workers;

pub use choice::choice;
pub use errors::{ErrorBits, GlasError};
pub use loader::{init_default, rt_load_binary_default, rt_loader_intercept, rt_run_builtin_tests};
pub use namespace::{Def, Namespace, NsAst, Resolved, TlTable};
pub use refct::Refct;
pub use registers::{RegisterRef, Volume};
pub use thread::{BinaryPeek, Glas};
pub use value::Value;

/// A thread with the default environment installed: primitives at `%`,
/// builtin compilers, and the user configuration when present.
pub fn init_thread() -> Result<Glas, GlasError> {
    let mut g = Glas::new();
    loader::init_default(&mut g)?;
    if !g.commit() {
        return Err(GlasError::error_op(format!(
            "default initialization failed to commit ({})",
            g.error_bits()
        )));
    }
    Ok(g)
}
