//! Phylogeny parsing and branch-index utilities.
//!
//! Reads the first TREE entry of a NEXUS file, normalizes node labels into
//! canonical branch keys, assigns a deterministic branch order, and
//! precomputes the per-branch bitmask artifacts the permutation engine runs
//! on.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{PhylopermError, Result};
use crate::mask::BranchMask;

/// Number of clade-size bins under the log2 scheme.
pub const NUM_CLADE_BINS: usize = 8;

/// A rooted labeled tree with canonical non-root branch indexing.
///
/// Nodes are indexed by parse id; branches are indexed 0..n-1 by a
/// post-order traversal that visits children in lexicographic order of their
/// canonical branch keys. All masks over branches share this indexing.
#[derive(Debug, Clone)]
pub struct CanonicalTree {
    pub root: usize,
    pub n_tips: usize,
    pub labels: Vec<String>,
    pub branch_key_by_node: Vec<String>,
    pub parent_by_node: Vec<Option<usize>>,
    pub children_by_node: Vec<Vec<usize>>,
    pub branch_length_by_node: Vec<f64>,
    pub tip_species_by_node: Vec<Option<String>>,
    pub tip_index_by_node: Vec<Option<usize>>,

    pub node_by_branch_index: Vec<usize>,
    pub branch_key_by_index: Vec<String>,
    pub branch_index_by_key: HashMap<String, usize>,
    pub parent_branch_by_index: Vec<Option<usize>>,
    pub branch_length_by_index: Vec<f64>,

    /// Proper ancestor branches of each branch.
    pub anc_mask_by_branch_index: Vec<BranchMask>,
    /// Proper descendant branches of each branch.
    pub desc_mask_by_branch_index: Vec<BranchMask>,
    /// Tip indices contained in the subtree at or below each branch.
    pub tip_mask_by_branch_index: Vec<BranchMask>,
    pub clade_size_by_branch_index: Vec<usize>,
    pub clade_bin_by_branch_index: Vec<u8>,
    pub all_mask: BranchMask,

    /// Stable SHA-256 over ordered branch keys and parent branch indices.
    pub fingerprint: String,
}

#[derive(Debug)]
struct RawNode {
    label: String,
    length: f64,
    children: Vec<usize>,
}

struct NewickParser<'a> {
    text: &'a [u8],
    i: usize,
    nodes: Vec<RawNode>,
}

impl<'a> NewickParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text: text.as_bytes(),
            i: 0,
            nodes: Vec::new(),
        }
    }

    fn parse(mut self) -> Result<(usize, Vec<RawNode>)> {
        let root = self.parse_subtree()?;
        self.skip_ws();
        if self.peek() == Some(b';') {
            self.i += 1;
        }
        self.skip_ws();
        if self.i != self.text.len() {
            return Err(PhylopermError::NewickParse {
                pos: self.i,
                detail: "unexpected trailing text".to_string(),
            });
        }
        Ok((root, self.nodes))
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.i).copied()
    }

    fn skip_ws(&mut self) {
        while self
            .peek()
            .map(|c| c.is_ascii_whitespace())
            .unwrap_or(false)
        {
            self.i += 1;
        }
    }

    fn consume(&mut self, ch: u8) -> Result<()> {
        if self.peek() != Some(ch) {
            return Err(PhylopermError::NewickParse {
                pos: self.i,
                detail: format!("expected '{}'", ch as char),
            });
        }
        self.i += 1;
        Ok(())
    }

    fn parse_label(&mut self) -> String {
        self.skip_ws();
        let start = self.i;
        while let Some(c) = self.peek() {
            if matches!(c, b',' | b'(' | b')' | b':' | b';') {
                break;
            }
            self.i += 1;
        }
        String::from_utf8_lossy(&self.text[start..self.i])
            .trim()
            .to_string()
    }

    fn parse_length(&mut self) -> Result<f64> {
        self.skip_ws();
        if self.peek() != Some(b':') {
            return Ok(f64::NAN);
        }
        self.i += 1;
        self.skip_ws();
        let start = self.i;
        while let Some(c) = self.peek() {
            if matches!(c, b',' | b'(' | b')' | b';') {
                break;
            }
            self.i += 1;
        }
        let raw = String::from_utf8_lossy(&self.text[start..self.i])
            .trim()
            .to_string();
        if raw.is_empty() {
            return Ok(f64::NAN);
        }
        raw.parse::<f64>().map_err(|_| PhylopermError::NewickParse {
            pos: start,
            detail: format!("invalid branch length '{raw}'"),
        })
    }

    fn parse_subtree(&mut self) -> Result<usize> {
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.consume(b'(')?;
            let mut children = Vec::new();
            loop {
                children.push(self.parse_subtree()?);
                self.skip_ws();
                if self.peek() == Some(b',') {
                    self.i += 1;
                    continue;
                }
                break;
            }
            self.skip_ws();
            self.consume(b')')?;
            let label = self.parse_label();
            let length = self.parse_length()?;
            let node_id = self.nodes.len();
            self.nodes.push(RawNode {
                label,
                length,
                children,
            });
            return Ok(node_id);
        }

        let label = self.parse_label();
        if label.is_empty() {
            return Err(PhylopermError::NewickParse {
                pos: self.i,
                detail: "empty tip label".to_string(),
            });
        }
        let length = self.parse_length()?;
        let node_id = self.nodes.len();
        self.nodes.push(RawNode {
            label,
            length,
            children: Vec::new(),
        });
        Ok(node_id)
    }
}

/// Strip a CAFE state suffix from a node label.
///
/// Example: `"Acanthochromis_polyacanthus<66>_1"` ->
/// `"Acanthochromis_polyacanthus<66>"`.
pub fn branch_key_from_label(label: &str) -> String {
    let label = label.trim();
    if let Some(pos) = label.rfind('_') {
        let (head, tail) = (&label[..pos], &label[pos + 1..]);
        if !head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return head.to_string();
        }
    }
    label.to_string()
}

/// Extract a species name from a tip-like branch key.
///
/// Example: `"Acanthochromis_polyacanthus<66>"` ->
/// `Some("Acanthochromis_polyacanthus")`. Internal-like keys such as
/// `"<12>"` yield `None`.
pub fn tip_species_from_branch_key(branch_key: &str) -> Option<String> {
    if branch_key.ends_with('>') {
        if let Some(pos) = branch_key.rfind('<') {
            let inner = &branch_key[pos + 1..branch_key.len() - 1];
            if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
                let head = &branch_key[..pos];
                return if head.is_empty() {
                    None
                } else {
                    Some(head.to_string())
                };
            }
        }
    }
    if branch_key.is_empty() {
        None
    } else {
        Some(branch_key.to_string())
    }
}

/// Clade-size bin under the log2 scheme: `⌊log2(size)⌋`, capped at 7.
pub fn log2_clade_bin(size: usize) -> u8 {
    debug_assert!(size > 0);
    let bin = 63 - (size as u64).leading_zeros() as u64;
    (bin as u8).min((NUM_CLADE_BINS - 1) as u8)
}

/// Extract the first `TREE name = newick;` entry from a NEXUS file.
pub fn read_first_tree_newick(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|e| PhylopermError::io(path, e))?;

    let mut started = false;
    let mut chunks: Vec<String> = Vec::new();
    for line in content.lines() {
        if !started {
            if line.contains("TREE") && line.contains('=') {
                started = true;
                let after = line.splitn(2, '=').nth(1).unwrap_or("").trim().to_string();
                let done = after.contains(';');
                chunks.push(after);
                if done {
                    break;
                }
            }
        } else {
            let part = line.trim().to_string();
            let done = part.contains(';');
            chunks.push(part);
            if done {
                break;
            }
        }
    }

    if chunks.is_empty() {
        return Err(PhylopermError::NoTreeEntry {
            path: path.to_path_buf(),
        });
    }
    let text = chunks.join(" ");
    match text.find(';') {
        Some(semi) => Ok(text[..=semi].to_string()),
        None => Err(PhylopermError::NoTreeEntry {
            path: path.to_path_buf(),
        }),
    }
}

/// Parse the first tree of a NEXUS file and build branch-index caches.
pub fn load_canonical_tree(path: &Path) -> Result<CanonicalTree> {
    let newick = read_first_tree_newick(path)?;
    canonical_tree_from_newick(&newick)
}

/// Build a [`CanonicalTree`] from Newick text.
pub fn canonical_tree_from_newick(newick: &str) -> Result<CanonicalTree> {
    let (root, nodes) = NewickParser::new(newick).parse()?;

    let n = nodes.len();
    let mut labels = vec![String::new(); n];
    let mut branch_key_by_node = vec![String::new(); n];
    let mut parent_by_node: Vec<Option<usize>> = vec![None; n];
    let mut children_by_node: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut branch_length_by_node = vec![f64::NAN; n];
    let mut tip_species_by_node: Vec<Option<String>> = vec![None; n];

    for (node_id, node) in nodes.iter().enumerate() {
        labels[node_id] = node.label.clone();
        branch_key_by_node[node_id] = branch_key_from_label(&node.label);
        children_by_node[node_id] = node.children.clone();
        branch_length_by_node[node_id] = node.length;
        for &child in &node.children {
            parent_by_node[child] = Some(node_id);
        }
    }

    // Deterministic child order: lexicographic by canonical branch key.
    {
        let keys = branch_key_by_node.clone();
        for children in children_by_node.iter_mut() {
            children.sort_by(|&a, &b| keys[a].cmp(&keys[b]));
        }
    }

    for (node_id, children) in children_by_node.iter().enumerate() {
        if children.is_empty() {
            tip_species_by_node[node_id] =
                tip_species_from_branch_key(&branch_key_by_node[node_id]);
        }
    }

    let order = postorder(root, &children_by_node);

    // Branch indices in post-order; tip indices in the same traversal.
    let mut node_by_branch_index: Vec<usize> = Vec::new();
    let mut branch_key_by_index: Vec<String> = Vec::new();
    let mut branch_index_by_key: HashMap<String, usize> = HashMap::new();
    let mut tip_index_by_node: Vec<Option<usize>> = vec![None; n];
    let mut n_tips = 0usize;

    for &node_id in &order {
        if children_by_node[node_id].is_empty() {
            tip_index_by_node[node_id] = Some(n_tips);
            n_tips += 1;
        }
        if node_id == root {
            continue;
        }
        let key = branch_key_by_node[node_id].clone();
        if key.is_empty() {
            return Err(PhylopermError::EmptyBranchKey { node_id });
        }
        if branch_index_by_key.contains_key(&key) {
            return Err(PhylopermError::DuplicateBranchKey { key });
        }
        let idx = node_by_branch_index.len();
        node_by_branch_index.push(node_id);
        branch_index_by_key.insert(key.clone(), idx);
        branch_key_by_index.push(key);
    }

    let m = node_by_branch_index.len();
    let node_to_branch: HashMap<usize, usize> = node_by_branch_index
        .iter()
        .enumerate()
        .map(|(idx, &node_id)| (node_id, idx))
        .collect();

    let branch_length_by_index: Vec<f64> = node_by_branch_index
        .iter()
        .map(|&node_id| branch_length_by_node[node_id])
        .collect();

    let mut bad_lengths: Vec<String> = Vec::new();
    for (idx, &len) in branch_length_by_index.iter().enumerate() {
        if !len.is_finite() || len < 0.0 {
            bad_lengths.push(format!("{}={}", branch_key_by_index[idx], len));
        }
    }
    if !bad_lengths.is_empty() {
        let extra = if bad_lengths.len() > 6 { " ..." } else { "" };
        bad_lengths.truncate(6);
        return Err(PhylopermError::InvalidBranchLength {
            preview: format!("{}{}", bad_lengths.join(", "), extra),
        });
    }

    // Subtree accumulators over the post-order.
    let mut tip_count_by_node = vec![0usize; n];
    let mut desc_mask_by_node: Vec<BranchMask> = vec![BranchMask::zeros(m); n];
    let mut tip_mask_by_node: Vec<BranchMask> = vec![BranchMask::zeros(n_tips); n];

    for &node_id in &order {
        let children = children_by_node[node_id].clone();
        if children.is_empty() {
            tip_count_by_node[node_id] = 1;
            if let Some(tip_idx) = tip_index_by_node[node_id] {
                tip_mask_by_node[node_id].set(tip_idx);
            }
        } else {
            let mut count = 0;
            let mut tips = BranchMask::zeros(n_tips);
            let mut desc = BranchMask::zeros(m);
            for &ch in &children {
                count += tip_count_by_node[ch];
                tips.union_with(&tip_mask_by_node[ch]);
                desc.union_with(&desc_mask_by_node[ch]);
                if let Some(&bidx) = node_to_branch.get(&ch) {
                    desc.set(bidx);
                }
            }
            tip_count_by_node[node_id] = count;
            tip_mask_by_node[node_id] = tips;
            desc_mask_by_node[node_id] = desc;
        }
    }

    let mut desc_mask_by_branch_index = Vec::with_capacity(m);
    let mut tip_mask_by_branch_index = Vec::with_capacity(m);
    let mut clade_size_by_branch_index = Vec::with_capacity(m);
    let mut clade_bin_by_branch_index = Vec::with_capacity(m);
    for &node_id in &node_by_branch_index {
        desc_mask_by_branch_index.push(desc_mask_by_node[node_id].clone());
        tip_mask_by_branch_index.push(tip_mask_by_node[node_id].clone());
        let size = tip_count_by_node[node_id];
        clade_size_by_branch_index.push(size);
        clade_bin_by_branch_index.push(log2_clade_bin(size));
    }

    let mut anc_mask_by_branch_index = Vec::with_capacity(m);
    let mut parent_branch_by_index = Vec::with_capacity(m);
    for &node_id in &node_by_branch_index {
        let mut anc = BranchMask::zeros(m);
        let mut p = parent_by_node[node_id];
        let mut parent_branch = None;
        while let Some(pid) = p {
            if pid != root {
                let bidx = node_to_branch[&pid];
                if parent_branch.is_none() {
                    parent_branch = Some(bidx);
                }
                anc.set(bidx);
            }
            p = parent_by_node[pid];
        }
        anc_mask_by_branch_index.push(anc);
        parent_branch_by_index.push(parent_branch);
    }

    let all_mask = BranchMask::ones(m);
    let fingerprint = compute_fingerprint(&branch_key_by_index, &parent_branch_by_index);

    Ok(CanonicalTree {
        root,
        n_tips,
        labels,
        branch_key_by_node,
        parent_by_node,
        children_by_node,
        branch_length_by_node,
        tip_species_by_node,
        tip_index_by_node,
        node_by_branch_index,
        branch_key_by_index,
        branch_index_by_key,
        parent_branch_by_index,
        branch_length_by_index,
        anc_mask_by_branch_index,
        desc_mask_by_branch_index,
        tip_mask_by_branch_index,
        clade_size_by_branch_index,
        clade_bin_by_branch_index,
        all_mask,
        fingerprint,
    })
}

impl CanonicalTree {
    pub fn n_branches(&self) -> usize {
        self.branch_key_by_index.len()
    }

    /// Post-order traversal of node ids (tips to root).
    pub fn postorder(&self) -> Vec<usize> {
        postorder(self.root, &self.children_by_node)
    }

    /// Pre-order traversal of node ids (root to tips).
    pub fn preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.labels.len());
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            for &ch in self.children_by_node[node].iter().rev() {
                stack.push(ch);
            }
        }
        out
    }

    /// Canonical branch key at the root node.
    pub fn root_branch_key(&self) -> &str {
        &self.branch_key_by_node[self.root]
    }

    /// Species names over tips, in tip-index order.
    pub fn tip_species(&self) -> Vec<&str> {
        let mut out: Vec<(usize, &str)> = Vec::with_capacity(self.n_tips);
        for (node_id, tip_idx) in self.tip_index_by_node.iter().enumerate() {
            if let (Some(idx), Some(sp)) = (tip_idx, self.tip_species_by_node[node_id].as_deref()) {
                out.push((*idx, sp));
            }
        }
        out.sort_by_key(|&(idx, _)| idx);
        out.into_iter().map(|(_, sp)| sp).collect()
    }
}

fn postorder(root: usize, children_by_node: &[Vec<usize>]) -> Vec<usize> {
    let mut out = Vec::with_capacity(children_by_node.len());
    // Two-phase stack so children are emitted before their parent.
    let mut stack: Vec<(usize, bool)> = vec![(root, false)];
    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            out.push(node);
        } else {
            stack.push((node, true));
            for &ch in children_by_node[node].iter().rev() {
                stack.push((ch, false));
            }
        }
    }
    out
}

fn compute_fingerprint(branch_keys: &[String], parents: &[Option<usize>]) -> String {
    let mut hasher = Sha256::new();
    for (key, parent) in branch_keys.iter().zip(parents) {
        hasher.update(key.as_bytes());
        hasher.update(b"\t");
        match parent {
            Some(p) => hasher.update(p.to_string().as_bytes()),
            None => hasher.update(b"-1"),
        }
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
