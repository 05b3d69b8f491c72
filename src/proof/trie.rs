//! Merkle-Patricia receipts trie
//!
//! Rebuilds the canonical receipts trie of a source block so an inclusion
//! witness for one receipt can be handed to a destination chain. Keys are
//! RLP(transaction index), values are the consensus receipt encodings, and
//! the computed root must match the header's receipts root before any
//! witness leaves this module.

use crate::hash::keccak256;

use super::rlp::{encode_bytes, encode_list, encode_uint, split_list};
use super::ProofError;

/// keccak256(rlp("")), the root of an empty trie.
pub const EMPTY_TRIE_ROOT: [u8; 32] = [
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
];

enum Node {
    Empty,
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<Node>,
    },
    Branch {
        children: Box<[Node; 16]>,
        value: Option<Vec<u8>>,
    },
}

impl Node {
    fn empty_branch() -> Node {
        Node::Branch {
            children: Box::new(std::array::from_fn(|_| Node::Empty)),
            value: None,
        }
    }
}

/// The trie over one block's receipts.
pub struct ReceiptsTrie {
    root: Node,
}

impl ReceiptsTrie {
    /// Build the trie from consensus-encoded receipts in transaction order.
    pub fn from_encoded_receipts(receipts: &[Vec<u8>]) -> Self {
        let mut root = Node::Empty;
        for (index, receipt) in receipts.iter().enumerate() {
            let key = nibbles(&receipt_key(index));
            root = insert(root, &key, receipt.clone());
        }
        Self { root }
    }

    pub fn root_hash(&self) -> [u8; 32] {
        keccak256(&encode_node(&self.root))
    }

    /// Inclusion witness for the receipt at `index`: the encodings of every
    /// hashed node on the path from the root, root first. Nodes shorter than
    /// 32 bytes are embedded in their parent and carry no separate entry.
    pub fn prove(&self, index: usize) -> Vec<Vec<u8>> {
        let key = nibbles(&receipt_key(index));
        let mut proof = Vec::new();
        let mut node = &self.root;
        let mut remaining = &key[..];
        loop {
            let encoded = encode_node(node);
            if proof.is_empty() || encoded.len() >= 32 {
                proof.push(encoded);
            }
            match node {
                Node::Empty | Node::Leaf { .. } => break,
                Node::Extension { path, child } => {
                    if remaining.len() < path.len() || &remaining[..path.len()] != &path[..] {
                        break;
                    }
                    remaining = &remaining[path.len()..];
                    node = child;
                }
                Node::Branch { children, .. } => {
                    if remaining.is_empty() {
                        break;
                    }
                    let idx = remaining[0] as usize;
                    remaining = &remaining[1..];
                    node = &children[idx];
                }
            }
        }
        proof
    }
}

/// Trie key for the receipt at a transaction index.
pub fn receipt_key(index: usize) -> Vec<u8> {
    encode_uint(index as u64)
}

fn nibbles(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 2);
    for byte in key {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn insert(node: Node, path: &[u8], value: Vec<u8>) -> Node {
    match node {
        Node::Empty => Node::Leaf {
            path: path.to_vec(),
            value,
        },
        Node::Leaf {
            path: leaf_path,
            value: leaf_value,
        } => {
            if leaf_path == path {
                return Node::Leaf {
                    path: leaf_path,
                    value,
                };
            }
            let common = common_prefix_len(&leaf_path, path);
            let branch = insert_into_branch(Node::empty_branch(), &leaf_path[common..], leaf_value);
            let branch = insert_into_branch(branch, &path[common..], value);
            wrap_prefix(&path[..common], branch)
        }
        Node::Extension {
            path: ext_path,
            child,
        } => {
            let common = common_prefix_len(&ext_path, path);
            if common == ext_path.len() {
                return Node::Extension {
                    path: ext_path,
                    child: Box::new(insert(*child, &path[common..], value)),
                };
            }
            // split the extension at the divergence point
            let ext_rest = &ext_path[common..];
            let demoted = if ext_rest.len() == 1 {
                *child
            } else {
                Node::Extension {
                    path: ext_rest[1..].to_vec(),
                    child,
                }
            };
            let mut branch = Node::empty_branch();
            if let Node::Branch { children, .. } = &mut branch {
                children[ext_rest[0] as usize] = demoted;
            }
            let branch = insert_into_branch(branch, &path[common..], value);
            wrap_prefix(&path[..common], branch)
        }
        Node::Branch {
            mut children,
            value: branch_value,
        } => {
            if path.is_empty() {
                return Node::Branch {
                    children,
                    value: Some(value),
                };
            }
            let idx = path[0] as usize;
            let child = std::mem::replace(&mut children[idx], Node::Empty);
            children[idx] = insert(child, &path[1..], value);
            Node::Branch {
                children,
                value: branch_value,
            }
        }
    }
}

fn insert_into_branch(branch: Node, path: &[u8], value: Vec<u8>) -> Node {
    let Node::Branch {
        mut children,
        value: branch_value,
    } = branch
    else {
        unreachable!("insert_into_branch called on a non-branch node");
    };
    if path.is_empty() {
        return Node::Branch {
            children,
            value: Some(value),
        };
    }
    let idx = path[0] as usize;
    let child = std::mem::replace(&mut children[idx], Node::Empty);
    children[idx] = insert(child, &path[1..], value);
    Node::Branch {
        children,
        value: branch_value,
    }
}

fn wrap_prefix(prefix: &[u8], node: Node) -> Node {
    if prefix.is_empty() {
        node
    } else {
        Node::Extension {
            path: prefix.to_vec(),
            child: Box::new(node),
        }
    }
}

/// Hex-prefix encoding of a nibble path (leaf flag in the high nibble).
fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let flag: u8 = if leaf { 2 } else { 0 };
    let mut out;
    let rest;
    if nibbles.len() % 2 == 0 {
        out = vec![flag << 4];
        rest = nibbles;
    } else {
        out = vec![((flag | 1) << 4) | nibbles[0]];
        rest = &nibbles[1..];
    }
    for pair in rest.chunks(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
    out
}

fn decode_hex_prefix(data: &[u8]) -> Result<(Vec<u8>, bool), ProofError> {
    let first = *data
        .first()
        .ok_or_else(|| ProofError::Malformed("empty hex-prefix path".into()))?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(ProofError::Malformed("bad hex-prefix flag".into()));
    }
    let leaf = flag & 2 != 0;
    let mut out = Vec::with_capacity(data.len() * 2);
    if flag & 1 != 0 {
        out.push(first & 0x0f);
    }
    for byte in &data[1..] {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    Ok((out, leaf))
}

fn encode_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Empty => encode_bytes(&[]),
        Node::Leaf { path, value } => encode_list(&[
            encode_bytes(&hex_prefix(path, true)),
            encode_bytes(value),
        ]),
        Node::Extension { path, child } => encode_list(&[
            encode_bytes(&hex_prefix(path, false)),
            child_reference(child),
        ]),
        Node::Branch { children, value } => {
            let mut items: Vec<Vec<u8>> = children.iter().map(child_reference).collect();
            items.push(match value {
                Some(v) => encode_bytes(v),
                None => encode_bytes(&[]),
            });
            encode_list(&items)
        }
    }
}

/// A child slot holds the node inline when its encoding is under 32 bytes,
/// otherwise the keccak of the encoding.
fn child_reference(node: &Node) -> Vec<u8> {
    if matches!(node, Node::Empty) {
        return encode_bytes(&[]);
    }
    let encoded = encode_node(node);
    if encoded.len() < 32 {
        encoded
    } else {
        encode_bytes(&keccak256(&encoded))
    }
}

/// Check a witness produced by [`ReceiptsTrie::prove`] against a trusted
/// root. Used by the pipeline self-check and the test suite; destination
/// chains run the equivalent logic on-chain.
pub fn verify_inclusion(
    root: &[u8; 32],
    index: usize,
    expected_value: &[u8],
    proof: &[Vec<u8>],
) -> Result<(), ProofError> {
    let key = nibbles(&receipt_key(index));
    let mut remaining = &key[..];
    let mut expected_hash = *root;
    let mut node_index = 0;

    loop {
        let node_bytes = proof
            .get(node_index)
            .ok_or_else(|| ProofError::Verification("witness exhausted".into()))?;
        node_index += 1;
        if keccak256(node_bytes) != expected_hash {
            return Err(ProofError::Verification("node hash mismatch".into()));
        }

        // follow inlined children without leaving this witness entry
        let mut current: &[u8] = node_bytes;
        'inline: loop {
            let items = split_list(current)?;
            match items.len() {
                17 => {
                    if remaining.is_empty() {
                        return if items[16].payload == expected_value {
                            Ok(())
                        } else {
                            Err(ProofError::Verification("branch value mismatch".into()))
                        };
                    }
                    let idx = remaining[0] as usize;
                    remaining = &remaining[1..];
                    let child = items[idx];
                    if child.is_list {
                        current = child.raw;
                        continue 'inline;
                    }
                    if child.payload.is_empty() {
                        return Err(ProofError::Verification("path leads to empty slot".into()));
                    }
                    if child.payload.len() != 32 {
                        return Err(ProofError::Verification("bad child reference".into()));
                    }
                    expected_hash.copy_from_slice(child.payload);
                    break 'inline;
                }
                2 => {
                    let (path, leaf) = decode_hex_prefix(items[0].payload)?;
                    if leaf {
                        return if path == remaining && items[1].payload == expected_value {
                            Ok(())
                        } else {
                            Err(ProofError::Verification("leaf mismatch".into()))
                        };
                    }
                    if remaining.len() < path.len() || remaining[..path.len()] != path[..] {
                        return Err(ProofError::Verification("extension path mismatch".into()));
                    }
                    remaining = &remaining[path.len()..];
                    let child = items[1];
                    if child.is_list {
                        current = child.raw;
                        continue 'inline;
                    }
                    if child.payload.len() != 32 {
                        return Err(ProofError::Verification("bad child reference".into()));
                    }
                    expected_hash.copy_from_slice(child.payload);
                    break 'inline;
                }
                _ => return Err(ProofError::Verification("malformed trie node".into())),
            }
        }
    }
}
