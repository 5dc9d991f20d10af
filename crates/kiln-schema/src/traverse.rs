//! Lazy graph traversal over concrete specs.

use std::collections::HashSet;
use std::sync::Arc;

use crate::concrete::ConcreteSpec;
use crate::deptype::DepTypes;
use crate::hash::DagHash;

/// Visit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Parents before children.
    Pre,
    /// Children before parents (install order).
    Post,
}

/// Iterator over unique nodes reachable through edges whose types intersect
/// the filter. The root is always yielded.
///
/// Finite because the graph is acyclic and nodes are visited once. Calling
/// [`ConcreteSpec::traverse`] again (or cloning a fresh iterator) restarts it.
#[derive(Debug, Clone)]
pub struct Traversal {
    order: Order,
    types: DepTypes,
    visited: HashSet<DagHash>,
    pre_stack: Vec<Arc<ConcreteSpec>>,
    post_stack: Vec<(Arc<ConcreteSpec>, usize)>,
}

impl Traversal {
    pub(crate) fn new(root: Arc<ConcreteSpec>, order: Order, types: DepTypes) -> Self {
        let mut t = Self {
            order,
            types,
            visited: HashSet::new(),
            pre_stack: Vec::new(),
            post_stack: Vec::new(),
        };
        match order {
            Order::Pre => t.pre_stack.push(root),
            Order::Post => {
                t.visited.insert(root.hash().clone());
                t.post_stack.push((root, 0));
            }
        }
        t
    }

    fn next_pre(&mut self) -> Option<Arc<ConcreteSpec>> {
        while let Some(node) = self.pre_stack.pop() {
            if !self.visited.insert(node.hash().clone()) {
                continue;
            }
            for edge in node.dependencies().iter().rev() {
                if edge.types.intersects(self.types) && !self.visited.contains(edge.spec.hash()) {
                    self.pre_stack.push(Arc::clone(&edge.spec));
                }
            }
            return Some(node);
        }
        None
    }

    fn next_post(&mut self) -> Option<Arc<ConcreteSpec>> {
        loop {
            let (node, idx) = self.post_stack.last_mut()?;
            let deps = node.dependencies();
            let next_child = deps[*idx..]
                .iter()
                .position(|e| e.types.intersects(self.types) && !self.visited.contains(e.spec.hash()))
                .map(|offset| *idx + offset);

            match next_child {
                Some(child_idx) => {
                    *idx = child_idx + 1;
                    let child = Arc::clone(&deps[child_idx].spec);
                    self.visited.insert(child.hash().clone());
                    self.post_stack.push((child, 0));
                }
                None => {
                    let (done, _) = self.post_stack.pop()?;
                    return Some(done);
                }
            }
        }
    }
}

impl Iterator for Traversal {
    type Item = Arc<ConcreteSpec>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.order {
            Order::Pre => self.next_pre(),
            Order::Post => self.next_post(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concrete::tests::diamond;

    fn names(t: Traversal) -> Vec<String> {
        t.map(|s| s.name().to_string()).collect()
    }

    #[test]
    fn pre_order_visits_each_node_once() {
        let app = diamond();
        assert_eq!(
            names(app.traverse(Order::Pre, DepTypes::ALL)),
            ["app", "cmake", "libbar", "zlib", "libfoo"]
        );
    }

    #[test]
    fn post_order_puts_children_first() {
        let app = diamond();
        let order = names(app.traverse(Order::Post, DepTypes::ALL));
        assert_eq!(order, ["cmake", "zlib", "libbar", "libfoo", "app"]);
    }

    #[test]
    fn edge_type_filter() {
        let app = diamond();
        let link_only = names(app.traverse(Order::Post, DepTypes::LINK));
        assert_eq!(link_only, ["zlib", "libbar", "libfoo", "app"]);
        let run_only = names(app.traverse(Order::Pre, DepTypes::RUN));
        assert_eq!(run_only, ["app", "libbar"]);
        let none = names(app.traverse(Order::Pre, DepTypes::NONE));
        assert_eq!(none, ["app"]);
    }

    #[test]
    fn traversal_restarts() {
        let app = diamond();
        let first = app.traverse(Order::Pre, DepTypes::ALL);
        let again = first.clone();
        assert_eq!(names(first), names(again));
        assert_eq!(app.traverse(Order::Post, DepTypes::ALL).count(), 5);
    }
}
