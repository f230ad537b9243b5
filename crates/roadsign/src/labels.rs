use std::path::Path;

use crate::Error;

/// Ordered class names; a prediction is an index into this list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels {
    names: Vec<String>,
}

impl ClassLabels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Reads a newline-delimited class list. Line `i` names class `i`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&content))
    }

    /// Parses the content of a class list file.
    ///
    /// Each line is trimmed; blank lines at the end of the file are ignored.
    pub fn parse(content: &str) -> Self {
        let mut names: Vec<String> = content.lines().map(|line| line.trim().to_string()).collect();

        while names.last().is_some_and(|name| name.is_empty()) {
            names.pop();
        }

        Self { names }
    }

    /// Fails unless there is exactly one label per model output.
    pub fn ensure_matches(&self, num_outputs: usize) -> Result<(), Error> {
        if self.names.len() != num_outputs {
            return Err(Error::ClassCountMismatch {
                labels: self.names.len(),
                outputs: num_outputs,
            });
        }

        Ok(())
    }

    pub fn get(&self, class_id: usize) -> Option<&str> {
        self.names.get(class_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}
