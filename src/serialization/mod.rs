//! Saving and loading model weights.
//!
//! ```rust,ignore
//! model.save("tabnet.nn1", cost)?;
//! let cost = model.load("tabnet.nn1")?;
//! ```

pub mod nn1;

pub use nn1::{read_nn1, write_nn1, SerializationError, NN1_EXTENSION, NN1_VERSION};
