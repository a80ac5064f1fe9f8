//! Activation functions as a closed set of variants.

use crate::nn::module::{check_arity, Forward, Module, NnResult};
use crate::tensor::Tensor;
use std::fmt;
use std::rc::Rc;

/// Activation applied elementwise (or row-wise for `Softmax` and `Sparsemax`,
/// over the last axis). Has no trainable parameters.
#[derive(Clone)]
pub enum Activation {
    Sigmoid,
    Tanh,
    ReLU,
    Softmax,
    Sparsemax,
    /// Any graph-building function of one tensor.
    Custom(Rc<dyn Fn(&Tensor) -> Tensor>),
}

impl Activation {
    pub fn custom(f: impl Fn(&Tensor) -> Tensor + 'static) -> Self {
        Activation::Custom(Rc::new(f))
    }

    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Sigmoid => x.sigmoid(),
            Activation::Tanh => x.tanh(),
            Activation::ReLU => x.relu(),
            Activation::Softmax => x.softmax(),
            Activation::Sparsemax => x.sparsemax(),
            Activation::Custom(f) => f(x),
        }
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Sigmoid => write!(f, "Sigmoid"),
            Activation::Tanh => write!(f, "Tanh"),
            Activation::ReLU => write!(f, "ReLU"),
            Activation::Softmax => write!(f, "Softmax"),
            Activation::Sparsemax => write!(f, "Sparsemax"),
            Activation::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl Module for Activation {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity("activation", inputs, 1)?;
        Ok(Forward::new(self.apply(&inputs[0])))
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;

    #[test]
    fn variants_map_to_graph_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let out = Activation::Sparsemax.forward(&[x.clone()]).unwrap().output;
        let custom = Activation::custom(|t| t.scale(2.0)).apply(&x);

        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(graph.get_node(out.node_id).unwrap().node_type, NodeType::Sparsemax(_)));
        assert!(matches!(graph.get_node(custom.node_id).unwrap().node_type, NodeType::Multiply(_, _)));
        assert!(Activation::ReLU.parameters().is_empty());
        assert_eq!(format!("{:?}", Activation::custom(|t| t.clone())), "Custom");
    }
}
