use std::collections::HashSet;

/// Looks for a cycle in a dependency list where `dependencies[i]` holds the
/// indices task `i` depends on. Returns the tasks along the first cycle found,
/// starting and ending with the same index.
pub fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    fn dfs(
        index: usize,
        dependencies: &[Vec<usize>],
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        if rec_stack.contains(&index) {
            let start = path.iter().position(|&i| i == index).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(index);
            return Some(cycle);
        }
        if !visited.insert(index) {
            return None;
        }

        rec_stack.insert(index);
        path.push(index);

        for &dep in dependencies.get(index).into_iter().flatten() {
            if let Some(cycle) = dfs(dep, dependencies, visited, rec_stack, path) {
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack.remove(&index);
        None
    }

    for index in 0..dependencies.len() {
        if !visited.contains(&index) {
            if let Some(cycle) = dfs(index, dependencies, &mut visited, &mut rec_stack, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}
