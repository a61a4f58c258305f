//! Leaf-path resolution over a conversation tree
//!
//! The viewer follows one leaf at a time. Resolving a leaf walks parent links
//! back to the root and annotates every node on the way with the leaves of
//! its sibling branches, so a renderer can offer "< 2/3 >" style switching.

use crate::error::ChatError;
use crate::ids::MessageId;
use crate::message::Message;
use crate::store::MessageMap;

/// A node on the displayed path together with its sibling branches
#[derive(Clone, Debug, PartialEq)]
pub struct MessageDisplay {
    pub message: Message,
    /// Leaf reached from each child of this node's parent, in child order
    pub sibling_leaf_ids: Vec<Option<MessageId>>,
    /// Position of this node among its parent's children
    pub sibling_curr_idx: usize,
}

impl MessageDisplay {
    pub fn sibling_count(&self) -> usize {
        self.sibling_leaf_ids.len()
    }

    pub fn previous_sibling_leaf(&self) -> Option<MessageId> {
        let idx = self.sibling_curr_idx.checked_sub(1)?;
        self.sibling_leaf_ids.get(idx).copied().flatten()
    }

    pub fn next_sibling_leaf(&self) -> Option<MessageId> {
        self.sibling_leaf_ids
            .get(self.sibling_curr_idx + 1)
            .copied()
            .flatten()
    }
}

/// Follow the last child from `id` down to a childless node.
///
/// Returns `None` when `id` is not in the map.
pub fn find_leaf_node(messages: &MessageMap, id: MessageId) -> Option<MessageId> {
    let mut current = messages.get(&id)?;
    // bounded so that corrupted data with a child cycle cannot hang the view
    for _ in 0..messages.len() {
        match current.children.last().and_then(|c| messages.get(c)) {
            Some(child) => current = child,
            None => break,
        }
    }
    Some(current.id)
}

pub fn root_node(messages: &MessageMap) -> Option<&Message> {
    messages.values().find(|m| m.is_root())
}

/// The leaf shown by default: the newest branch at every fork
pub fn natural_leaf(messages: &MessageMap) -> Option<MessageId> {
    root_node(messages).and_then(|root| find_leaf_node(messages, root.id))
}

fn resolve_leaf(messages: &MessageMap, leaf: Option<MessageId>) -> Option<MessageId> {
    match leaf {
        None => natural_leaf(messages),
        Some(id) if messages.contains_key(&id) => Some(id),
        Some(id) => {
            let fallback = messages.keys().next_back().copied();
            tracing::debug!("leaf {} not found, falling back to {:?}", id, fallback);
            fallback
        }
    }
}

/// Resolve the root-to-leaf path shown for `leaf`.
///
/// A node whose parent is missing ends the walk; it and everything above it
/// are left out and the partial path is returned.
pub fn resolve_path(messages: &MessageMap, leaf: Option<MessageId>) -> Vec<MessageDisplay> {
    let Some(leaf) = resolve_leaf(messages, leaf) else {
        return Vec::new();
    };

    let mut chain: Vec<&Message> = Vec::new();
    let mut cursor = messages.get(&leaf);
    while let Some(node) = cursor {
        if chain.len() >= messages.len() {
            tracing::warn!("parent chain of {} loops, truncating path", leaf);
            break;
        }
        match node.parent {
            None => {
                chain.push(node);
                break;
            }
            Some(parent_id) => match messages.get(&parent_id) {
                Some(parent) => {
                    chain.push(node);
                    cursor = Some(parent);
                }
                None => {
                    tracing::warn!(
                        "message {} references missing parent {}, excluding it from the path",
                        node.id,
                        parent_id
                    );
                    break;
                }
            },
        }
    }
    chain.reverse();

    chain
        .into_iter()
        .filter(|m| !m.is_root())
        .map(|m| display_node(messages, m))
        .collect()
}

fn display_node(messages: &MessageMap, message: &Message) -> MessageDisplay {
    let siblings = message
        .parent
        .and_then(|p| messages.get(&p))
        .map(|p| p.children.as_slice())
        .unwrap_or_default();

    match siblings.iter().position(|c| *c == message.id) {
        Some(idx) => MessageDisplay {
            message: message.clone(),
            sibling_leaf_ids: siblings.iter().map(|c| find_leaf_node(messages, *c)).collect(),
            sibling_curr_idx: idx,
        },
        None => {
            tracing::debug!("message {} is not listed by its parent", message.id);
            MessageDisplay {
                message: message.clone(),
                sibling_leaf_ids: vec![find_leaf_node(messages, message.id)],
                sibling_curr_idx: 0,
            }
        }
    }
}

/// Report the first node whose parent is missing
pub fn check_integrity(messages: &MessageMap) -> Result<(), ChatError> {
    for message in messages.values() {
        if let Some(parent_id) = message.parent {
            if !messages.contains_key(&parent_id) {
                return Err(ChatError::OrphanNode {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message.id,
                    parent_id,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ConversationId;
    use crate::message::MessageDraft;
    use crate::store::MessageStore;

    fn ids(path: &[MessageDisplay]) -> Vec<u64> {
        path.iter().map(|d| d.message.id.get()).collect()
    }

    /// root(0) -> user(1) -> assistant(2)
    fn simple_tree() -> (MessageStore, ConversationId) {
        let mut store = MessageStore::new();
        let conv = ConversationId::from_string("c");
        let root = store.create_conversation(&conv);
        let user = store.append(&conv, root, MessageDraft::user("hi", vec![])).unwrap();
        store.append(&conv, user, MessageDraft::assistant("hello")).unwrap();
        (store, conv)
    }

    #[test]
    fn test_single_branch_path() {
        let (store, conv) = simple_tree();
        let path = resolve_path(store.nodes(&conv).unwrap(), Some(MessageId::new(2)));

        assert_eq!(ids(&path), vec![1, 2]);
        for node in &path {
            assert_eq!(node.sibling_leaf_ids, vec![Some(MessageId::new(2))]);
            assert_eq!(node.sibling_curr_idx, 0);
        }
    }

    #[test]
    fn test_regenerated_sibling_path() {
        let (mut store, conv) = simple_tree();
        let regen = store
            .append(&conv, MessageId::new(1), MessageDraft::assistant("hey"))
            .unwrap();
        assert_eq!(regen, MessageId::new(3));
        assert_eq!(
            store.message(&conv, MessageId::new(1)).unwrap().children,
            vec![MessageId::new(2), MessageId::new(3)]
        );

        let nodes = store.nodes(&conv).unwrap();
        let path = resolve_path(nodes, Some(regen));
        let last = path.last().unwrap();
        assert_eq!(
            last.sibling_leaf_ids,
            vec![Some(MessageId::new(2)), Some(MessageId::new(3))]
        );
        assert_eq!(last.sibling_curr_idx, 1);
        assert_eq!(last.previous_sibling_leaf(), Some(MessageId::new(2)));
        assert_eq!(last.next_sibling_leaf(), None);

        // the old branch is still reachable
        assert_eq!(ids(&resolve_path(nodes, Some(MessageId::new(2)))), vec![1, 2]);
    }

    #[test]
    fn test_none_leaf_follows_newest_branch() {
        let (mut store, conv) = simple_tree();
        let other = store
            .append(&conv, MessageId::new(0), MessageDraft::user("second", vec![]))
            .unwrap();
        let reply = store.append(&conv, other, MessageDraft::assistant("ok")).unwrap();

        let nodes = store.nodes(&conv).unwrap();
        assert_eq!(natural_leaf(nodes), Some(reply));
        let path = resolve_path(nodes, None);
        assert_eq!(ids(&path), vec![other.get(), reply.get()]);
        assert_eq!(
            path[0].sibling_leaf_ids,
            vec![Some(MessageId::new(2)), Some(reply)]
        );
        assert_eq!(path[0].sibling_curr_idx, 1);
    }

    #[test]
    fn test_paths_are_ancestor_ordered_without_root() {
        let (mut store, conv) = simple_tree();
        let mut parent = MessageId::new(2);
        for i in 0..4 {
            parent = store
                .append(&conv, parent, MessageDraft::user(format!("m{}", i), vec![]))
                .unwrap();
        }
        let nodes = store.nodes(&conv).unwrap();

        for leaf in nodes.keys() {
            let path = resolve_path(nodes, Some(*leaf));
            assert!(path.iter().all(|d| !d.message.is_root()));
            for pair in path.windows(2) {
                assert_eq!(pair[1].message.parent, Some(pair[0].message.id));
            }
            for node in &path {
                let parent = &nodes[&node.message.parent.unwrap()];
                assert_eq!(node.sibling_leaf_ids.len(), parent.children.len());
                assert_eq!(parent.children[node.sibling_curr_idx], node.message.id);
            }
        }
    }

    #[test]
    fn test_unknown_leaf_falls_back_to_newest_node() {
        let (store, conv) = simple_tree();
        let path = resolve_path(store.nodes(&conv).unwrap(), Some(MessageId::new(77)));
        assert_eq!(ids(&path), vec![1, 2]);
    }

    #[test]
    fn test_find_leaf_node_not_found() {
        let (store, conv) = simple_tree();
        let nodes = store.nodes(&conv).unwrap();
        assert_eq!(find_leaf_node(nodes, MessageId::new(9)), None);
        assert_eq!(find_leaf_node(nodes, MessageId::new(0)), Some(MessageId::new(2)));
    }

    #[test]
    fn test_orphan_is_excluded_from_path() {
        let (store, conv) = simple_tree();
        let mut nodes = store.nodes(&conv).unwrap().clone();
        let orphan = MessageDraft::user("lost", vec![]).into_message(
            MessageId::new(10),
            conv.clone(),
            Some(MessageId::new(9)),
        );
        let child = MessageDraft::assistant("below").into_message(
            MessageId::new(11),
            conv.clone(),
            Some(MessageId::new(10)),
        );
        nodes.insert(orphan.id, orphan);
        nodes.insert(child.id, child);

        let path = resolve_path(&nodes, Some(MessageId::new(11)));
        assert_eq!(ids(&path), vec![11]);

        assert!(matches!(
            check_integrity(&nodes),
            Err(ChatError::OrphanNode { message_id, .. }) if message_id == MessageId::new(10)
        ));
        assert!(check_integrity(store.nodes(&conv).unwrap()).is_ok());
    }

    #[test]
    fn test_empty_map_resolves_to_nothing() {
        assert!(resolve_path(&MessageMap::new(), None).is_empty());
    }
}
