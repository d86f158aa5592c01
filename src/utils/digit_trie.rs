//! Counting trie keyed by ASCII decimal digits.
//!
//! Used to count occurrences of integer-like keys (taxids) straight from the
//! byte buffers they appear in. A key's `String` form is built once, when its
//! node is first reached with `create_if_absent`, and reused for reporting.

const NO_CHILD: u32 = 0;

#[derive(Debug, Clone, Default)]
pub struct DigitNode {
    pub count: u64,
    key: Option<Box<str>>,
    children: [u32; 10],
}

impl DigitNode {
    /// The digit string leading to this node, once it has been materialized.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    #[inline]
    pub fn inc(&mut self) -> u64 {
        self.count += 1;
        self.count
    }

    #[inline]
    pub fn add(&mut self, n: u64) -> u64 {
        self.count += n;
        self.count
    }
}

/// Arena-backed 10-ary trie; node 0 is the root and never carries a key.
#[derive(Debug, Clone)]
pub struct DigitTrie {
    nodes: Vec<DigitNode>,
}

impl Default for DigitTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![DigitNode::default()],
        }
    }

    /// Finds the node for the digits `bytes[start..end]`.
    ///
    /// Returns `None` if the span is empty or holds a non-digit byte, or if the
    /// node does not exist and `create_if_absent` is false.
    pub fn get(
        &mut self,
        bytes: &[u8],
        start: usize,
        end: usize,
        create_if_absent: bool,
    ) -> Option<&mut DigitNode> {
        let span = bytes.get(start..end)?;
        if span.is_empty() {
            return None;
        }

        let mut current = 0usize;
        for &b in span {
            if !b.is_ascii_digit() {
                return None;
            }
            let digit = (b - b'0') as usize;
            let next = self.nodes[current].children[digit];
            current = if next != NO_CHILD {
                next as usize
            } else if create_if_absent {
                let id = self.nodes.len();
                self.nodes.push(DigitNode::default());
                self.nodes[current].children[digit] = id as u32;
                id
            } else {
                return None;
            };
        }

        let node = &mut self.nodes[current];
        if node.key.is_none() {
            if !create_if_absent {
                // Only an inner node of some longer key so far.
                return None;
            }
            // The span was validated as ASCII digits above.
            let key: String = span.iter().map(|&b| b as char).collect();
            node.key = Some(key.into_boxed_str());
        }
        Some(node)
    }

    /// Increments the counter for the digit span and returns the new count.
    pub fn inc(&mut self, bytes: &[u8], start: usize, end: usize) -> Option<u64> {
        self.get(bytes, start, end, true).map(DigitNode::inc)
    }

    /// Count for a key, zero if it was never seen.
    pub fn count(&mut self, key: &[u8]) -> u64 {
        self.get(key, 0, key.len(), false).map_or(0, |n| n.count)
    }

    /// Number of keys materialized so far.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy depth-first walk over every node with a non-zero count, in
    /// lexicographic order of the digit strings.
    pub fn iter(&self) -> DigitTrieIter<'_> {
        DigitTrieIter {
            trie: self,
            stack: vec![0],
        }
    }

    /// Calls `sink` once per node with a non-zero count.
    pub fn collect<F: FnMut(&str, u64)>(&self, mut sink: F) {
        for (key, count) in self.iter() {
            sink(key, count);
        }
    }
}

pub struct DigitTrieIter<'a> {
    trie: &'a DigitTrie,
    stack: Vec<u32>,
}

impl<'a> Iterator for DigitTrieIter<'a> {
    type Item = (&'a str, u64);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            let node = &self.trie.nodes[id as usize];
            for &child in node.children.iter().rev() {
                if child != NO_CHILD {
                    self.stack.push(child);
                }
            }
            if node.count > 0 {
                if let Some(key) = node.key.as_deref() {
                    return Some((key, node.count));
                }
            }
        }
        None
    }
}
