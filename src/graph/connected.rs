use super::layout::Layout;
use crate::store::UnitId;
use petgraph::unionfind::UnionFind;
use std::collections::{BTreeSet, HashMap};

/// Connected components of the undirected join relation.
#[derive(Debug, Clone, Default)]
pub struct Components {
    /// Component of each unit; `None` when the unit joins nothing and nothing
    /// joins it.
    pub region: Vec<Option<usize>>,
    pub members: Vec<BTreeSet<UnitId>>,
}

impl Components {
    pub fn len(&self) -> usize { self.members.len() }
    pub fn is_empty(&self) -> bool { self.members.is_empty() }
}

/// Units with a zero rampart scale no longer carry their join, so they do not
/// connect to their parent.
pub fn connected_components(layout: &Layout) -> Components {
    let n = layout.len();
    let mut uf = UnionFind::<usize>::new(n);
    let mut touched = vec![false; n];

    for id in layout.ids().rev() {
        let unit = layout.unit(id);
        if unit.rampart_scale == 0.0 { continue; }
        for parent in layout.setup(id).parents.iter().flatten() {
            uf.union(id.index(), parent.index());
            touched[id.index()] = true;
            touched[parent.index()] = true;
        }
    }

    let mut region = vec![None; n];
    let mut members: Vec<BTreeSet<UnitId>> = Vec::new();
    let mut by_root: HashMap<usize, usize> = HashMap::new();
    for ax in 0..n {
        if !touched[ax] { continue; }
        let root = uf.find_mut(ax);
        let cx = *by_root.entry(root).or_insert_with(|| {
            members.push(BTreeSet::new());
            members.len() - 1
        });
        members[cx].insert(UnitId::new(ax));
        region[ax] = Some(cx);
    }
    Components { region, members }
}
