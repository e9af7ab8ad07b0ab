use crate::types::WorkResult;

/// A node callback.
///
/// `run` receives exactly one payload per predecessor, in the order the edges
/// were registered with [`Graph::precede`](crate::graph::Graph::precede). An
/// input node receives its staged payload, or nothing if none was given.
///
/// Different runs may invoke the same callback concurrently, hence `Sync`.
/// Any closure `Fn(&[P]) -> WorkResult<P>` is a `Work<P>`.
pub trait Work<P>: Send + Sync {
    /// Compute the node's output from its inputs.
    ///
    /// # Errors
    /// An error fails the current run only; the graph stays usable.
    fn run(&self, inputs: &[P]) -> WorkResult<P>;
}

impl<P, F> Work<P> for F
where
    F: Fn(&[P]) -> WorkResult<P> + Send + Sync,
{
    #[inline]
    fn run(&self, inputs: &[P]) -> WorkResult<P> {
        self(inputs)
    }
}
