//! Semantic manifest invariants not expressible via JSON Schema.

use std::collections::{HashMap, HashSet};

use crate::manifest::Manifest;

/// Check semantic invariants not expressible in JSON Schema:
/// - No duplicate ids
/// - Every dependency names a known story, and never the story itself
/// - No dependency cycles
/// - A `passed` story only depends on `passed` stories
pub fn validate_invariants(manifest: &Manifest) -> Vec<String> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for story in &manifest.stories {
        if !seen.insert(story.id.as_str()) {
            errors.push(format!("duplicate story id '{}'", story.id));
        }
    }

    for story in &manifest.stories {
        for dep in &story.depends_on {
            if dep == &story.id {
                errors.push(format!("{}: depends on itself", story.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", story.id, dep));
            } else if story.is_passed() && !manifest.story(dep).is_some_and(|d| d.is_passed()) {
                errors.push(format!(
                    "{}: marked passed but dependency '{}' has not passed",
                    story.id, dep
                ));
            }
        }
    }

    if let Some(cycle) = find_cycle(manifest) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// First dependency cycle found in manifest order, as a closed id path.
fn find_cycle(manifest: &Manifest) -> Option<Vec<String>> {
    let edges: HashMap<&str, Vec<&str>> = manifest
        .stories
        .iter()
        .map(|story| {
            let deps = story
                .depends_on
                .iter()
                .map(String::as_str)
                .filter(|dep| *dep != story.id)
                .collect();
            (story.id.as_str(), deps)
        })
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for story in &manifest.stories {
        let mut stack = Vec::new();
        if let Some(cycle) = visit(story.id.as_str(), &edges, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|entry| *entry == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(id, Mark::Visiting);
    stack.push(id);
    for dep in edges.get(id).into_iter().flatten() {
        if !edges.contains_key(dep) {
            continue;
        }
        if let Some(cycle) = visit(dep, edges, marks, stack) {
            return Some(cycle);
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}
