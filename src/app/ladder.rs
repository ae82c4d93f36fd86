use std::fmt;

/// Every cause collected while walking a fallback ladder, in attempt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderFailure<E> {
    pub causes: Vec<(String, E)>,
}

impl<E: fmt::Display> fmt::Display for LadderFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.causes.is_empty() {
            return write!(f, "no strategy to attempt");
        }
        let parts = self
            .causes
            .iter()
            .map(|(label, cause)| format!("[{label}] {cause}"))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join("; "))
    }
}

/// Tries `steps` in order and stops at the first success, returning it with the step index.
pub fn run_ladder<S, T, E>(
    steps: &[S],
    label: impl Fn(&S) -> String,
    mut attempt: impl FnMut(usize, &S) -> Result<T, E>,
) -> Result<(usize, T), LadderFailure<E>> {
    let mut causes = Vec::new();
    for (index, step) in steps.iter().enumerate() {
        match attempt(index, step) {
            Ok(value) => return Ok((index, value)),
            Err(cause) => causes.push((label(step), cause)),
        }
    }
    Err(LadderFailure { causes })
}
