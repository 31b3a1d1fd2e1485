use crate::sources::traits::Stream;

/// A stream's position in its source's forest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNode {
    pub name: String,
    pub parent: Option<String>,
}

impl StreamNode {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.into()),
        }
    }

    pub fn of(stream: &dyn Stream) -> Self {
        Self {
            name: stream.name().to_string(),
            parent: stream.parent().map(String::from),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
