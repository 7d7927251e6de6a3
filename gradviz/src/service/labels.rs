//! Human readable class names for the ImageNet models.
//!
//! The label table is read from a synset file (one class name per line, in
//! class-index order), the same file distributed alongside the model zoo
//! checkpoints. When no table is available, classes are reported by index.

use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

#[derive(Debug, Default, Clone)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    /// Loads a synset file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let names = reader
            .lines()
            .collect::<Result<Vec<String>, _>>()?
            .into_iter()
            .map(|line| {
                // zoo synset lines look like "n01484850 great white shark"
                match line.split_once(' ') {
                    Some((id, rest)) if id.starts_with('n') && id.len() == 9 => {
                        String::from(rest)
                    }
                    _ => line,
                }
            })
            .collect();
        Ok(Self { names })
    }

    /// An empty table: every class is reported by index.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// The name of a class, falling back to `class <index>`.
    pub fn name(&self, class_index: usize) -> String {
        self.names
            .get(class_index)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_entries_fall_back_to_index() {
        let labels = Labels::empty();
        assert_eq!(labels.name(281), "class 281");
    }

    #[test]
    fn synset_ids_are_stripped() {
        let labels = Labels {
            names: vec![String::from("tench, Tinca tinca")],
        };
        assert_eq!(labels.name(0), "tench, Tinca tinca");
    }
}
