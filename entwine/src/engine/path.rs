use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Field(String),
    Index(usize),
}

/// Dotted ancestry path of a node inside a submitted graph, e.g. `root.steps.0.condition`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    segments: Vec<Segment>,
}

impl NodePath {
    pub fn root() -> Self {
        Self {
            segments: vec![Segment::Field("root".to_string())],
        }
    }

    /// Path of the `index`th document in a batch commit.
    pub fn root_at(index: usize) -> Self {
        Self::root().index(index)
    }

    pub fn child(&self, field: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Field(field.to_string()));
        Self { segments }
    }

    pub fn index(&self, index: usize) -> Self {
        let mut segments = self.segments.clone();
        segments.push(Segment::Index(index));
        Self { segments }
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.segments.iter().enumerate() {
            if position > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Field(name) => f.write_str(name)?,
                Segment::Index(index) => write!(f, "{index}")?,
            }
        }
        Ok(())
    }
}
