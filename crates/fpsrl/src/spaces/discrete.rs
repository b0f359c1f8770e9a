//! Discrete action space

/// Discrete space with n possible values: {0, 1, ..., n-1}
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Discrete {
    /// Number of possible values
    pub n: usize,
    shape: Vec<usize>,
}

impl Discrete {
    /// Create a new discrete space with n values
    pub fn new(n: usize) -> Self {
        assert!(n > 0, "Discrete space must have at least 1 element");
        Self { n, shape: vec![1] }
    }

    /// Whether a raw policy output addresses a valid action.
    pub fn contains_action(&self, action: i64) -> bool {
        action >= 0 && (action as usize) < self.n
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_action() {
        let space = Discrete::new(3);
        assert!(space.contains_action(0));
        assert!(space.contains_action(2));
        assert!(!space.contains_action(3));
        assert!(!space.contains_action(-1));
    }
}
