//! Delegation brief rendering.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::manifest::Story;

const BRIEF_TEMPLATE: &str = include_str!("prompts/brief.md");

static ENV: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("brief", BRIEF_TEMPLATE)
        .expect("brief template should be valid");
    env
});

/// Story fields exposed to the template.
#[derive(Debug, Clone, Serialize)]
struct StoryContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    depends_on: &'a [String],
    files: &'a [String],
}

impl<'a> From<&'a Story> for StoryContext<'a> {
    fn from(story: &'a Story) -> Self {
        Self {
            id: &story.id,
            title: &story.title,
            description: story.description.trim(),
            depends_on: &story.depends_on,
            files: &story.files,
        }
    }
}

/// Everything the brief needs for one delegation.
#[derive(Debug, Clone)]
pub struct BriefInput<'a> {
    pub story: &'a Story,
    /// Stories delegated alongside the primary (teams mode only).
    pub peers: &'a [&'a Story],
    pub refactor_required: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Why the previous attempt was rejected.
    pub failure: Option<&'a str>,
    pub manifest_path: &'a str,
}

pub fn render_brief(input: &BriefInput<'_>) -> Result<String> {
    let template = ENV.get_template("brief").context("load brief template")?;
    let peers: Vec<StoryContext<'_>> = input.peers.iter().map(|peer| (*peer).into()).collect();
    let rendered = template
        .render(context! {
            story => StoryContext::from(input.story),
            peers => peers,
            refactor_required => input.refactor_required,
            attempt => input.attempt,
            max_attempts => input.max_attempts,
            failure => input.failure.map(str::trim).filter(|s| !s.is_empty()),
            manifest_path => input.manifest_path,
        })
        .context("render brief")?;
    Ok(rendered)
}
