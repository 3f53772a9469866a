// Copyright 2024 Ulvetanna Inc.
use std::fmt;

/// A rendered call tree: one label per node, children drawn with box characters.
pub struct LogTree {
    pub label: String,
    pub children: Vec<LogTree>,
}

impl fmt::Display for LogTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.label)?;
        self.write_children(f, &mut String::new())
    }
}

impl LogTree {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }

    fn write_children(&self, f: &mut fmt::Formatter<'_>, indent: &mut String) -> fmt::Result {
        let last = self.children.len().saturating_sub(1);
        for (i, child) in self.children.iter().enumerate() {
            let (branch, continuation) = if i == last {
                ("└── ", "   ")
            } else {
                ("├── ", "│  ")
            };
            writeln!(f, "{indent}{branch}{}", child.label)?;

            let restore = indent.len();
            indent.push_str(continuation);
            child.write_children(f, indent)?;
            indent.truncate(restore);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_nested_children() {
        let tree = LogTree {
            label: "root".into(),
            children: vec![
                LogTree::leaf("first"),
                LogTree {
                    label: "second".into(),
                    children: vec![LogTree::leaf("a"), LogTree::leaf("b")],
                },
            ],
        };
        assert_eq!(
            tree.to_string(),
            "root\n├── first\n└── second\n   ├── a\n   └── b\n"
        );
    }
}
