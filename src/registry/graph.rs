//! Module dependency graph: cycle detection and registration order
//!
//! A module points at every module it depends on, required or optional.
//! Dependencies naming something that is not declared (the built-in broker
//! module, or a module that is simply missing) are skipped here; the registry
//! reports those when it resolves each module.
//!
//! One depth-first walk in declaration order does both jobs: a module is
//! placed after all of its dependencies, and reaching a module that is still
//! on the current path means the path has closed a cycle.

use std::collections::HashMap;

use super::descriptor::ModuleDescriptor;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Fresh,
    OnPath,
    Placed,
}

struct Walk<'a> {
    descriptors: &'a [ModuleDescriptor],
    by_name: HashMap<&'a str, usize>,
    marks: Vec<Mark>,
    path: Vec<usize>,
    order: Vec<usize>,
}

impl<'a> Walk<'a> {
    fn new(descriptors: &'a [ModuleDescriptor]) -> Self {
        Self {
            descriptors,
            by_name: descriptors.iter().enumerate().map(|(i, d)| (d.name.as_str(), i)).collect(),
            marks: vec![Mark::Fresh; descriptors.len()],
            path: Vec::new(),
            order: Vec::with_capacity(descriptors.len()),
        }
    }

    /// Place `idx` after its dependencies, or return the cycle it sits on
    fn place(&mut self, idx: usize) -> Result<(), Vec<String>> {
        match self.marks[idx] {
            Mark::Placed => return Ok(()),
            Mark::OnPath => {
                let mut cycle: Vec<String> = self
                    .path
                    .iter()
                    .map(|&i| self.descriptors[i].name.clone())
                    .collect();
                cycle.push(self.descriptors[idx].name.clone());
                return Err(cycle);
            }
            Mark::Fresh => {}
        }

        self.marks[idx] = Mark::OnPath;
        self.path.push(idx);

        let descriptors = self.descriptors;
        for dep in descriptors[idx].dependency_names() {
            let Some(&dep_idx) = self.by_name.get(dep) else {
                continue;
            };
            self.place(dep_idx)?;
        }

        self.path.pop();
        self.marks[idx] = Mark::Placed;
        self.order.push(idx);
        Ok(())
    }
}

/// Registration order for `descriptors`, as indices, dependencies first
///
/// Modules with no ordering constraint between them keep declaration order.
/// On a cycle, returns the module names along it, starting from the first
/// declared module that reaches it and ending with the module that closes it.
pub fn topological_sort(descriptors: &[ModuleDescriptor]) -> Result<Vec<usize>, Vec<String>> {
    let mut walk = Walk::new(descriptors);
    for idx in 0..descriptors.len() {
        walk.place(idx)?;
    }
    Ok(walk.order)
}

/// Check that the declared modules can be ordered at all
pub fn validate_dependency_graph(descriptors: &[ModuleDescriptor]) -> Result<(), Vec<String>> {
    topological_sort(descriptors).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Version;

    fn module(name: &str, deps: &[&str]) -> ModuleDescriptor {
        deps.iter().fold(ModuleDescriptor::new(name, Version::new(1, 0)), |d, dep| {
            d.depends_on(*dep, Version::new(1, 0))
        })
    }

    fn names(descriptors: &[ModuleDescriptor], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| descriptors[i].name.clone()).collect()
    }

    #[test]
    fn test_acyclic_graph_validates() {
        let descriptors = vec![module("a", &[]), module("b", &["a"]), module("c", &["a", "b"])];
        assert!(validate_dependency_graph(&descriptors).is_ok());
    }

    #[test]
    fn test_cycle_reported_along_path() {
        let descriptors = vec![module("a", &["c"]), module("b", &["a"]), module("c", &["b"])];
        let cycle = validate_dependency_graph(&descriptors).unwrap_err();
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let descriptors = vec![module("a", &["a"])];
        assert_eq!(validate_dependency_graph(&descriptors).unwrap_err(), vec!["a", "a"]);
    }

    #[test]
    fn test_optional_edges_count_for_cycles() {
        let descriptors = vec![
            module("a", &["b"]),
            ModuleDescriptor::new("b", Version::new(1, 0)).optionally_depends_on("a", Version::new(1, 0)),
        ];
        assert!(validate_dependency_graph(&descriptors).is_err());
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let descriptors = vec![module("nav", &["MessageBroker", "missing"])];
        assert_eq!(topological_sort(&descriptors).unwrap(), vec![0]);
    }

    #[test]
    fn test_topological_sort_dependencies_first() {
        let descriptors = vec![module("a", &["b"]), module("b", &["c"]), module("c", &[]), module("d", &[])];
        let order = topological_sort(&descriptors).unwrap();
        assert_eq!(names(&descriptors, &order), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_topological_sort_diamond() {
        let descriptors = vec![
            module("top", &["left", "right"]),
            module("left", &["base"]),
            module("right", &["base"]),
            module("base", &[]),
        ];
        let order = topological_sort(&descriptors).unwrap();
        assert_eq!(names(&descriptors, &order), vec!["base", "left", "right", "top"]);
    }

    #[test]
    fn test_shared_dependency_placed_once() {
        let descriptors = vec![module("ui", &["nav", "nav"]), module("nav", &[]), module("map", &["nav"])];
        let order = topological_sort(&descriptors).unwrap();
        assert_eq!(names(&descriptors, &order), vec!["nav", "ui", "map"]);
    }

    #[test]
    fn test_topological_sort_rejects_cycle() {
        let descriptors = vec![module("a", &["b"]), module("b", &["a"])];
        assert!(topological_sort(&descriptors).is_err());
    }
}
