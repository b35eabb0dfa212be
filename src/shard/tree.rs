//! Balanced k-ary broadcast tree and the double shard around a process.
//!
//! Processes are organised into shards of `shard_size` members. Every
//! process belongs to one or two shards: the parent shard (its parent and
//! its co-children) and the child shard (itself and its direct children).
//! Each sibling in a shard speaks for the whole subtree it roots, the parent
//! speaks for the rest of the tree.
//!
//! Unreachable processes are placed into subtrees that were excised from the
//! tree, so that every excision stays within the fault budget
//! `⌊(n−1)/3⌋` of the subtree's parent.

use std::collections::{BTreeMap, VecDeque};

use thiserror::Error;

use crate::config::MIN_SHARD_SIZE;
use crate::utilities::crypto::ProcessId;
use crate::view::{TreeView, View, ViewData};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TreeError {
    #[error("broadcaster is contained in the node set")]
    BroadcasterInNodes,
    #[error("too many unreachable nodes: {unreachable} of {total}")]
    TooManyUnreachable { unreachable: usize, total: usize },
    #[error("failed to excise subtrees for unreachable nodes")]
    ExcisionFailed,
    #[error("shard size {0} is below the minimum of {MIN_SHARD_SIZE}")]
    ShardSizeTooSmall(usize),
    #[error("tree view is empty")]
    EmptyTreeView,
    #[error("process is not part of the tree view")]
    ProcessNotInTree,
}

/// The parent-shard and child-shard pair surrounding one process.
///
/// Neighbour ids are back references into the tree view, never owning
/// handles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DoubleShard {
    /// Parent of this process; the broadcaster has none.
    pub parent: Option<ProcessId>,
    /// Co-children of the parent at this level.
    pub siblings: ViewData,
    /// Direct children in the child shard.
    pub children: ViewData,
    /// Parent ∪ siblings ∪ children.
    pub neighbours: ViewData,

    /// Ancestors and their unrelated descendants, visible via the parent.
    pub parent_view: ViewData,
    /// Per sibling: the subtree that sibling roots.
    pub sibling_views: BTreeMap<ProcessId, ViewData>,
    /// Per child: the subtree that child roots.
    pub child_views: BTreeMap<ProcessId, ViewData>,
}

struct TreeNode {
    max_nodes_to_remove: usize,
    node_count: usize,
    child_index: usize,
    parent: Option<usize>,
    children: Vec<Option<usize>>,
}

/// Builds the balanced k-ary tree skeleton over `node_count` slots, filling
/// levels in BFS order.
fn build_tree(node_count: usize, shard_size: usize) -> Vec<TreeNode> {
    let mut tree: Vec<TreeNode> = Vec::with_capacity(node_count);
    if node_count == 0 {
        return tree;
    }

    tree.push(TreeNode {
        max_nodes_to_remove: 0,
        node_count: 1,
        child_index: 0,
        parent: None,
        children: vec![],
    });

    let child_count = shard_size - 1;
    let mut parent = 0usize;
    let mut level_index = 0usize;
    let mut child_index = 0usize;
    let mut level_node_count = child_count;

    for index in 1..node_count {
        tree.push(TreeNode {
            max_nodes_to_remove: 0,
            node_count: 1,
            child_index,
            parent: Some(parent),
            children: vec![],
        });
        tree[parent].children.push(Some(index));
        let mut node = Some(parent);
        while let Some(current) = node {
            tree[current].node_count += 1;
            node = tree[current].parent;
        }

        child_index += 1;
        level_index += 1;
        if level_index >= level_node_count {
            // Level complete; descend to the leftmost node of the new
            // deepest level.
            parent = 0;
            while let Some(&Some(first_child)) = tree[parent].children.first() {
                parent = first_child;
            }
            level_node_count *= child_count;
            level_index = 0;
            child_index = 0;
        } else if child_index >= child_count {
            // This parent is full; step to the next parent on its level.
            let mut current_level_index = level_index;
            let mut parent_indexes = vec![];
            while current_level_index >= child_count {
                parent = tree[parent].parent.unwrap_or(0);
                current_level_index /= child_count;
                parent_indexes.push(current_level_index % child_count);
            }
            for child in parent_indexes.into_iter().rev() {
                if let Some(Some(next)) = tree[parent].children.get(child) {
                    parent = *next;
                }
            }
            child_index = 0;
        }
    }

    tree
}

/// Fills `view` slots of the subtree rooted at `root` in BFS order from
/// `ids`.
fn add_processes_to_view(
    view: &mut TreeView,
    ids: &mut impl Iterator<Item = ProcessId>,
    tree: &[TreeNode],
    root: usize,
    add_root: bool,
) {
    let mut queue = VecDeque::new();
    if add_root {
        if let Some(id) = ids.next() {
            view[root] = id;
        }
    }
    for child in tree[root].children.iter().flatten() {
        queue.push_back(*child);
    }

    while let Some(index) = queue.pop_front() {
        if let Some(id) = ids.next() {
            view[index] = id;
        }
        for child in tree[index].children.iter().flatten() {
            queue.push_back(*child);
        }
    }
}

/// Arranges the broadcast membership into the tree ordering: index 0 is the
/// broadcaster, reachable nodes fill the live subtrees, unreachable nodes
/// fill the excised ones.
pub fn create_tree_view(
    reachable_nodes: &ViewData,
    unreachable_nodes: &ViewData,
    broadcaster: &ProcessId,
    shard_size: usize,
) -> Result<TreeView, TreeError> {
    if reachable_nodes.contains(broadcaster) || unreachable_nodes.contains(broadcaster) {
        return Err(TreeError::BroadcasterInNodes);
    }

    let mut unreachable_node_count = unreachable_nodes.len();
    let node_count = reachable_nodes.len() + unreachable_node_count + 1;
    if unreachable_node_count > View::max_invalid_processes(node_count) {
        log::warn!(
            "too many unreachable nodes {unreachable_node_count} in view ({node_count})"
        );
        return Err(TreeError::TooManyUnreachable {
            unreachable: unreachable_node_count,
            total: node_count,
        });
    }

    let mut view: TreeView = vec![ProcessId::default(); node_count];
    view[0] = *broadcaster;

    if unreachable_node_count == 0 || node_count <= shard_size {
        for (index, id) in reachable_nodes.iter().chain(unreachable_nodes.iter()).enumerate() {
            view[index + 1] = *id;
        }
        return Ok(view);
    }

    let mut tree = build_tree(node_count, shard_size);
    tree[0].max_nodes_to_remove = View::max_invalid_processes(tree[0].node_count);
    let mut queue: VecDeque<usize> = tree[0].children.iter().flatten().copied().collect();

    let mut removed_subtrees = Vec::with_capacity(unreachable_node_count);
    while unreachable_node_count > 0 {
        let Some(subtree) = queue.pop_front() else {
            return Err(TreeError::ExcisionFailed);
        };

        let subtree_count = tree[subtree].node_count;
        let parent = tree[subtree].parent.unwrap_or(0);
        if subtree_count <= unreachable_node_count
            && subtree_count <= tree[parent].max_nodes_to_remove
        {
            removed_subtrees.push(subtree);
            unreachable_node_count -= subtree_count;
            let child_index = tree[subtree].child_index;
            tree[parent].children[child_index] = None;
            let mut node = Some(parent);
            while let Some(current) = node {
                tree[current].max_nodes_to_remove -= subtree_count;
                node = tree[current].parent;
            }
        } else {
            tree[subtree].max_nodes_to_remove = View::max_invalid_processes(subtree_count);
            for child in tree[subtree].children.iter().flatten() {
                queue.push_back(*child);
            }
        }
    }

    let mut reachable = reachable_nodes.iter().copied();
    add_processes_to_view(&mut view, &mut reachable, &tree, 0, false);

    let mut unreachable = unreachable_nodes.iter().copied();
    for subtree in removed_subtrees {
        add_processes_to_view(&mut view, &mut unreachable, &tree, subtree, true);
    }

    Ok(view)
}

/// Derives the double shard of `this_process_id` within the tree ordering.
pub fn create_shard(
    view: &TreeView,
    this_process_id: &ProcessId,
    shard_size: usize,
) -> Result<DoubleShard, TreeError> {
    if shard_size < MIN_SHARD_SIZE {
        return Err(TreeError::ShardSizeTooSmall(shard_size));
    }
    if view.is_empty() {
        return Err(TreeError::EmptyTreeView);
    }

    let mut shard = DoubleShard::default();

    let node_count = view.len();
    let child_count = shard_size - 1;

    // Walk levels until this process is found; everything before it starts
    // in the parent view.
    let mut index = 0usize;
    let mut level_index = 0usize;
    let mut level_node_count = 1usize;
    let mut found = false;
    while index < node_count {
        let id = view[index];
        if id == *this_process_id {
            found = true;
            break;
        }
        shard.parent_view.insert(id);
        level_index += 1;
        if level_index >= level_node_count {
            level_index = 0;
            level_node_count *= child_count;
        }
        index += 1;
    }
    if !found {
        log::warn!("process {this_process_id} not found in tree");
        return Err(TreeError::ProcessNotInTree);
    }

    let this_node_level_index = level_index;
    let child_index = level_index % child_count;
    let parent_level_index = level_index / child_count;
    let parent_level_node_count = level_node_count / child_count;
    // Sibling and child subtree owners by their level index.
    let mut sibling_slots: BTreeMap<usize, ProcessId> = BTreeMap::new();
    let mut child_slots: BTreeMap<usize, ProcessId> = BTreeMap::new();

    if level_node_count > 1 {
        let level_start_index = index - level_index;
        let parent = view[level_start_index - (parent_level_node_count - parent_level_index)];
        shard.parent = Some(parent);
        shard.neighbours.insert(parent);

        let siblings_start_index = parent_level_index * child_count;
        for i in 0..child_count {
            if i == child_index {
                continue;
            }
            let sibling_level_index = siblings_start_index + i;
            let sibling_index = level_start_index + sibling_level_index;
            if sibling_index >= node_count {
                break;
            }

            let id = view[sibling_index];
            shard.parent_view.remove(&id);
            shard.siblings.insert(id);
            shard.neighbours.insert(id);
            shard.sibling_views.insert(id, ViewData::from([id]));
            sibling_slots.insert(sibling_level_index, id);
        }

        // The rest of this level belongs to the parent view.
        index += child_count - child_index;
        while index < level_start_index + level_node_count && index < node_count {
            shard.parent_view.insert(view[index]);
            index += 1;
        }

        level_index = level_node_count - 1;
    } else {
        index += 1;
    }

    let siblings_level_node_count = level_node_count;
    let children_level_node_count = siblings_level_node_count * child_count;
    while index < node_count {
        level_index += 1;
        if level_index >= level_node_count {
            level_index = 0;
            level_node_count *= child_count;
        }

        let id = view[index];
        if level_index * parent_level_node_count / level_node_count == parent_level_index {
            let siblings_level_index =
                level_index * siblings_level_node_count / level_node_count;
            if siblings_level_index == this_node_level_index {
                let children_level_index =
                    level_index * children_level_node_count / level_node_count;
                match child_slots.get(&children_level_index) {
                    None => {
                        shard.children.insert(id);
                        shard.neighbours.insert(id);
                        shard.child_views.insert(id, ViewData::from([id]));
                        child_slots.insert(children_level_index, id);
                    }
                    Some(owner) => {
                        if let Some(child_view) = shard.child_views.get_mut(owner) {
                            child_view.insert(id);
                        }
                    }
                }
            } else if let Some(owner) = sibling_slots.get(&siblings_level_index) {
                if let Some(sibling_view) = shard.sibling_views.get_mut(owner) {
                    sibling_view.insert(id);
                }
            }
        } else {
            shard.parent_view.insert(id);
        }

        index += 1;
    }

    Ok(shard)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use crate::view::test::process_id;

    use super::*;

    /// Builds reachable ids 2..=(n-u), unreachable ids above them, with
    /// broadcaster 1, and checks the produced ordering: every unreachable
    /// node sits exactly at an excised slot, reachable nodes fill the rest
    /// in order.
    fn run_tree_test(
        process_count: u8,
        shard_size: usize,
        unreachable_node_count: u8,
        unreachable_node_indexes: &[(usize, u8)],
    ) {
        let broadcaster = process_id(1);
        let reachable: ViewData = (2..=process_count - unreachable_node_count)
            .map(process_id)
            .collect();
        let unreachable: ViewData = (process_count - unreachable_node_count + 1..=process_count)
            .map(process_id)
            .collect();

        let mut expected: TreeView = vec![ProcessId::default(); process_count as usize];
        expected[0] = broadcaster;
        let slots: BTreeMap<usize, u8> = unreachable_node_indexes.iter().copied().collect();
        for (slot, tag) in &slots {
            expected[*slot] = process_id(*tag);
        }
        let mut reachable_iter = reachable.iter();
        for index in 1..process_count as usize {
            if !slots.contains_key(&index) {
                expected[index] = *reachable_iter.next().unwrap();
            }
        }

        let view = create_tree_view(&reachable, &unreachable, &broadcaster, shard_size).unwrap();
        assert_eq!(expected, view);
    }

    #[test]
    fn test_tree_view_single_excision() {
        run_tree_test(6, 5, 1, &[(2, 6)]);
    }

    #[test]
    fn test_tree_view_max_unreachable_shard5() {
        run_tree_test(
            44,
            5,
            14,
            &[
                (2, 31),
                (9, 32),
                (10, 33),
                (11, 34),
                (12, 35),
                (37, 36),
                (38, 37),
                (39, 38),
                (40, 39),
                (41, 40),
                (42, 41),
                (43, 42),
                (13, 43),
                (17, 44),
            ],
        );
    }

    #[test]
    fn test_tree_view_one_subtree_shard5() {
        run_tree_test(44, 5, 5, &[(3, 40), (13, 41), (14, 42), (15, 43), (16, 44)]);
    }

    #[test]
    fn test_tree_view_two_single_slots_shard6() {
        run_tree_test(7, 6, 2, &[(1, 6), (6, 7)]);
    }

    #[test]
    fn test_tree_view_21_nodes_shard6() {
        run_tree_test(21, 6, 3, &[(4, 19), (5, 20), (6, 21)]);
    }

    #[test]
    fn test_tree_view_21_nodes_max_unreachable_shard6() {
        run_tree_test(
            21,
            6,
            6,
            &[(1, 16), (6, 17), (7, 18), (8, 19), (9, 20), (10, 21)],
        );
    }

    #[test]
    fn test_tree_view_71_nodes_max_unreachable_shard6() {
        run_tree_test(
            71,
            6,
            23,
            &[
                (2, 49),
                (11, 50),
                (12, 51),
                (13, 52),
                (14, 53),
                (15, 54),
                (56, 55),
                (57, 56),
                (58, 57),
                (59, 58),
                (60, 59),
                (61, 60),
                (62, 61),
                (63, 62),
                (64, 63),
                (65, 64),
                (66, 65),
                (67, 66),
                (68, 67),
                (69, 68),
                (70, 69),
                (16, 70),
                (21, 71),
            ],
        );
    }

    #[test]
    fn test_tree_view_no_unreachable_is_flat_fill() {
        run_tree_test(100, 6, 0, &[]);
    }

    #[test]
    fn test_tree_view_100_nodes_shard6() {
        run_tree_test(100, 6, 3, &[(20, 98), (21, 99), (26, 100)]);
    }

    #[test]
    fn test_tree_view_100_nodes_four_unreachable_shard6() {
        run_tree_test(100, 6, 4, &[(20, 97), (21, 98), (26, 99), (31, 100)]);
    }

    #[test]
    fn test_tree_view_100_nodes_tail_subtree_excision_shard6() {
        run_tree_test(
            100,
            6,
            5,
            &[(19, 96), (96, 97), (97, 98), (98, 99), (99, 100)],
        );
    }

    #[test]
    fn test_tree_view_100_nodes_deep_excision_shard6() {
        run_tree_test(
            100,
            6,
            10,
            &[
                (4, 91),
                (21, 92),
                (22, 93),
                (23, 94),
                (24, 95),
                (25, 96),
                (20, 97),
                (26, 98),
                (31, 99),
                (36, 100),
            ],
        );
    }

    #[test]
    fn test_tree_view_100_nodes_twenty_unreachable_shard6() {
        run_tree_test(
            100,
            6,
            20,
            &[
                (4, 81),
                (21, 82),
                (22, 83),
                (23, 84),
                (24, 85),
                (25, 86),
                (5, 87),
                (26, 88),
                (27, 89),
                (28, 90),
                (29, 91),
                (30, 92),
                (6, 93),
                (31, 94),
                (32, 95),
                (33, 96),
                (34, 97),
                (35, 98),
                (20, 99),
                (36, 100),
            ],
        );
    }

    #[test]
    fn test_tree_view_100_nodes_thirty_unreachable_shard6() {
        run_tree_test(
            100,
            6,
            30,
            &[
                (3, 71),
                (16, 72),
                (17, 73),
                (18, 74),
                (19, 75),
                (20, 76),
                (81, 77),
                (82, 78),
                (83, 79),
                (84, 80),
                (85, 81),
                (86, 82),
                (87, 83),
                (88, 84),
                (89, 85),
                (90, 86),
                (91, 87),
                (92, 88),
                (93, 89),
                (94, 90),
                (95, 91),
                (96, 92),
                (97, 93),
                (98, 94),
                (99, 95),
                (21, 96),
                (26, 97),
                (31, 98),
                (36, 99),
                (41, 100),
            ],
        );
    }

    #[test]
    fn test_tree_view_100_nodes_max_unreachable_shard6() {
        run_tree_test(
            100,
            6,
            33,
            &[
                (1, 68),
                (6, 69),
                (7, 70),
                (8, 71),
                (9, 72),
                (10, 73),
                (31, 74),
                (32, 75),
                (33, 76),
                (34, 77),
                (35, 78),
                (36, 79),
                (37, 80),
                (38, 81),
                (39, 82),
                (40, 83),
                (41, 84),
                (42, 85),
                (43, 86),
                (44, 87),
                (45, 88),
                (46, 89),
                (47, 90),
                (48, 91),
                (49, 92),
                (50, 93),
                (51, 94),
                (52, 95),
                (53, 96),
                (54, 97),
                (55, 98),
                (20, 99),
                (21, 100),
            ],
        );
    }

    #[test]
    fn test_tree_view_23_nodes_cascading_excision_shard6() {
        run_tree_test(
            23,
            6,
            5,
            &[(4, 19), (21, 20), (22, 21), (5, 22), (6, 23)],
        );
    }

    #[test]
    fn test_tree_view_85_nodes_shard6() {
        run_tree_test(
            85,
            6,
            18,
            &[
                (3, 68),
                (16, 69),
                (17, 70),
                (18, 71),
                (19, 72),
                (20, 73),
                (81, 74),
                (82, 75),
                (83, 76),
                (84, 77),
                (4, 78),
                (21, 79),
                (22, 80),
                (23, 81),
                (24, 82),
                (25, 83),
                (26, 84),
                (31, 85),
            ],
        );
    }

    /// One unreachable node in a 22-process broadcast: the unreachable node
    /// takes over the first subtree small enough to excise (the empty
    /// fifth child of the root), and the first-level shard of the process
    /// at index 1 sees the broadcaster as parent.
    #[test]
    fn test_tree_with_one_unreachable_node() {
        let broadcaster = process_id(1);
        let reachable: ViewData = (2..=21).map(process_id).collect();
        let unreachable: ViewData = [process_id(22)].into();

        let view = create_tree_view(&reachable, &unreachable, &broadcaster, 6).unwrap();

        assert_eq!(22, view.len());
        assert_eq!(broadcaster, view[0]);
        assert_eq!(process_id(22), view[5]);

        let shard = create_shard(&view, &process_id(2), 6).unwrap();
        assert_eq!(Some(broadcaster), shard.parent);
        assert_eq!(
            Into::<ViewData>::into([process_id(3), process_id(4), process_id(5), process_id(22)]),
            shard.siblings,
            "the unreachable node occupies the excised first-level slot"
        );
        assert_eq!(
            (6..=10).map(process_id).collect::<ViewData>(),
            shard.children
        );
    }

    #[test]
    fn test_tree_view_size_and_membership() {
        let broadcaster = process_id(1);
        let reachable: ViewData = (2..=20).map(process_id).collect();
        let unreachable: ViewData = [process_id(21), process_id(22)].into();

        let view = create_tree_view(&reachable, &unreachable, &broadcaster, 6).unwrap();

        assert_eq!(22, view.len());
        assert_eq!(broadcaster, view[0]);
        let mut members: Vec<_> = view.clone();
        members.sort();
        members.dedup();
        assert_eq!(22, members.len());
    }

    #[test]
    fn test_tree_view_rejects_broadcaster_in_nodes() {
        let broadcaster = process_id(1);
        let reachable: ViewData = [process_id(1), process_id(2)].into();
        let unreachable = ViewData::new();

        assert_eq!(
            Err(TreeError::BroadcasterInNodes),
            create_tree_view(&reachable, &unreachable, &broadcaster, 6)
        );
    }

    #[test]
    fn test_tree_view_rejects_too_many_unreachable() {
        let broadcaster = process_id(1);
        let reachable: ViewData = (2..=7).map(process_id).collect();
        let unreachable: ViewData = (8..=11).map(process_id).collect();

        // 11 processes tolerate three faults, not four.
        assert_eq!(
            Err(TreeError::TooManyUnreachable {
                unreachable: 4,
                total: 11
            }),
            create_tree_view(&reachable, &unreachable, &broadcaster, 5)
        );
    }

    fn run_shard_test(
        process_count: u8,
        shard_size: usize,
        id: u8,
        expected_parent: Option<u8>,
        expected_siblings: &[u8],
        expected_children: &[u8],
        expected_parent_view: &[u8],
        expected_sibling_views: &[(u8, &[u8])],
        expected_child_views: &[(u8, &[u8])],
    ) {
        let view: TreeView = (1..=process_count).map(process_id).collect();

        let shard = create_shard(&view, &process_id(id), shard_size).unwrap();

        assert_eq!(expected_parent.map(process_id), shard.parent);
        assert_eq!(
            expected_siblings.iter().copied().map(process_id).collect::<ViewData>(),
            shard.siblings
        );
        assert_eq!(
            expected_children.iter().copied().map(process_id).collect::<ViewData>(),
            shard.children
        );
        let mut expected_neighbours: ViewData = shard.siblings.clone();
        expected_neighbours.extend(shard.children.iter().copied());
        if let Some(parent) = shard.parent {
            expected_neighbours.insert(parent);
        }
        assert_eq!(expected_neighbours, shard.neighbours);
        assert_eq!(
            expected_parent_view.iter().copied().map(process_id).collect::<ViewData>(),
            shard.parent_view
        );

        assert_eq!(expected_sibling_views.len(), shard.sibling_views.len());
        for (owner, members) in expected_sibling_views {
            assert_eq!(
                &members.iter().copied().map(process_id).collect::<ViewData>(),
                shard.sibling_views.get(&process_id(*owner)).unwrap()
            );
        }

        assert_eq!(expected_child_views.len(), shard.child_views.len());
        for (owner, members) in expected_child_views {
            assert_eq!(
                &members.iter().copied().map(process_id).collect::<ViewData>(),
                shard.child_views.get(&process_id(*owner)).unwrap()
            );
        }
    }

    #[test]
    fn test_shard_broadcaster_process() {
        run_shard_test(
            44,
            5,
            1,
            None,
            &[],
            &[2, 3, 4, 5],
            &[],
            &[],
            &[
                (
                    2,
                    &[
                        2, 6, 7, 8, 9, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35,
                        36, 37,
                    ],
                ),
                (3, &[3, 10, 11, 12, 13, 38, 39, 40, 41, 42, 43, 44]),
                (4, &[4, 14, 15, 16, 17]),
                (5, &[5, 18, 19, 20, 21]),
            ],
        );
    }

    #[test]
    fn test_shard_first_process() {
        run_shard_test(
            44,
            5,
            2,
            Some(1),
            &[3, 4, 5],
            &[6, 7, 8, 9],
            &[1],
            &[
                (3, &[3, 10, 11, 12, 13, 38, 39, 40, 41, 42, 43, 44]),
                (4, &[4, 14, 15, 16, 17]),
                (5, &[5, 18, 19, 20, 21]),
            ],
            &[
                (6, &[6, 22, 23, 24, 25]),
                (7, &[7, 26, 27, 28, 29]),
                (8, &[8, 30, 31, 32, 33]),
                (9, &[9, 34, 35, 36, 37]),
            ],
        );
    }

    #[test]
    fn test_shard_intermediate_process() {
        run_shard_test(
            44,
            5,
            7,
            Some(2),
            &[6, 8, 9],
            &[26, 27, 28, 29],
            &[
                1, 2, 3, 4, 5, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 38, 39, 40, 41,
                42, 43, 44,
            ],
            &[
                (6, &[6, 22, 23, 24, 25]),
                (8, &[8, 30, 31, 32, 33]),
                (9, &[9, 34, 35, 36, 37]),
            ],
            &[(26, &[26]), (27, &[27]), (28, &[28]), (29, &[29])],
        );
    }

    #[test]
    fn test_shard_leaf_process() {
        // Everything except the leaf's own shard is visible via the parent.
        let parent_view: Vec<u8> = (1..=44).filter(|id| ![14, 15, 16, 17].contains(id)).collect();
        run_shard_test(
            44,
            5,
            16,
            Some(4),
            &[14, 15, 17],
            &[],
            &parent_view,
            &[(14, &[14]), (15, &[15]), (17, &[17])],
            &[],
        );
    }

    #[test]
    fn test_shard_last_process() {
        let parent_view: Vec<u8> = (1..=41).collect();
        run_shard_test(
            44,
            5,
            44,
            Some(11),
            &[42, 43],
            &[],
            &parent_view,
            &[(42, &[42]), (43, &[43])],
            &[],
        );
    }

    #[test]
    fn test_shard_first_process_shard6() {
        run_shard_test(
            55,
            6,
            2,
            Some(1),
            &[3, 4, 5, 6],
            &[7, 8, 9, 10, 11],
            &[1],
            &[
                (3, &[3, 12, 13, 14, 15, 16]),
                (4, &[4, 17, 18, 19, 20, 21]),
                (5, &[5, 22, 23, 24, 25, 26]),
                (6, &[6, 27, 28, 29, 30, 31]),
            ],
            &[
                (7, &[7, 32, 33, 34, 35, 36]),
                (8, &[8, 37, 38, 39, 40, 41]),
                (9, &[9, 42, 43, 44, 45, 46]),
                (10, &[10, 47, 48, 49, 50, 51]),
                (11, &[11, 52, 53, 54, 55]),
            ],
        );
    }

    #[test]
    fn test_shard_broadcaster_process_shard6() {
        run_shard_test(
            44,
            6,
            1,
            None,
            &[],
            &[2, 3, 4, 5, 6],
            &[],
            &[],
            &[
                (
                    2,
                    &[2, 7, 8, 9, 10, 11, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44],
                ),
                (3, &[3, 12, 13, 14, 15, 16]),
                (4, &[4, 17, 18, 19, 20, 21]),
                (5, &[5, 22, 23, 24, 25, 26]),
                (6, &[6, 27, 28, 29, 30, 31]),
            ],
        );
    }

    #[test]
    fn test_shard_leaf_process_shard6() {
        // Everything except the leaf's own shard is visible via the parent.
        let parent_view: Vec<u8> = (1..=66).filter(|id| *id < 22 || *id > 26).collect();
        run_shard_test(
            66,
            6,
            23,
            Some(5),
            &[22, 24, 25, 26],
            &[],
            &parent_view,
            &[(22, &[22]), (24, &[24]), (25, &[25]), (26, &[26])],
            &[],
        );
    }

    #[test]
    fn test_shard_intermediate_process_shard6() {
        let parent_view: Vec<u8> = (1..=56).filter(|id| !(12..=16).contains(id)).collect();
        run_shard_test(
            77,
            6,
            12,
            Some(3),
            &[13, 14, 15, 16],
            &[57, 58, 59, 60, 61],
            &parent_view,
            &[
                (13, &[13, 62, 63, 64, 65, 66]),
                (14, &[14, 67, 68, 69, 70, 71]),
                (15, &[15, 72, 73, 74, 75, 76]),
                (16, &[16, 77]),
            ],
            &[(57, &[57]), (58, &[58]), (59, &[59]), (60, &[60]), (61, &[61])],
        );
    }

    #[test]
    fn test_shard_last_process_shard6() {
        let parent_view: Vec<u8> = (1..=86).collect();
        run_shard_test(
            88,
            6,
            88,
            Some(18),
            &[87],
            &[],
            &parent_view,
            &[(87, &[87])],
            &[],
        );
    }

    #[test]
    fn test_shard_few_processes_large_shard() {
        run_shard_test(
            4,
            10,
            3,
            Some(1),
            &[2, 4],
            &[],
            &[1],
            &[(2, &[2]), (4, &[4])],
            &[],
        );
    }

    #[test]
    fn test_shard_regions_partition_the_view() {
        let view: TreeView = (1..=44).map(process_id).collect();
        for id in [1u8, 2, 7, 16, 44] {
            let this = process_id(id);
            let shard = create_shard(&view, &this, 5).unwrap();

            // Neighbours are exactly parent ∪ siblings ∪ children.
            let mut neighbours = shard.siblings.clone();
            neighbours.extend(shard.children.iter().copied());
            if let Some(parent) = shard.parent {
                neighbours.insert(parent);
            }
            assert_eq!(neighbours, shard.neighbours);

            // Parent view, sibling views, child views and the process itself
            // cover the whole tree without overlap.
            let mut covered: Vec<ProcessId> = vec![this];
            covered.extend(shard.parent_view.iter().copied());
            for members in shard.sibling_views.values() {
                covered.extend(members.iter().copied());
            }
            for members in shard.child_views.values() {
                covered.extend(members.iter().copied());
            }
            let total = covered.len();
            covered.sort();
            covered.dedup();
            assert_eq!(total, covered.len(), "regions overlap for process {id}");
            assert_eq!(view.len(), covered.len(), "regions miss processes for {id}");
        }
    }

    #[test]
    fn test_shard_rejects_small_shard_size() {
        let view: TreeView = (1..=10).map(process_id).collect();
        assert_eq!(
            Err(TreeError::ShardSizeTooSmall(3)),
            create_shard(&view, &process_id(1), 3)
        );
    }

    #[test]
    fn test_shard_rejects_unknown_process() {
        let view: TreeView = (1..=10).map(process_id).collect();
        assert_eq!(
            Err(TreeError::ProcessNotInTree),
            create_shard(&view, &process_id(99), 5)
        );
    }
}
