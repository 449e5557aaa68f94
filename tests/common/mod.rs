#![allow(dead_code)]

use std::fs;
use std::path::Path;

use covlua::instrument::loader::LoadedModule;
use covlua::model::BlockId;
use covlua::{Config, HostEvent, Session, Strategy};
use tempfile::TempDir;

/// A throwaway project directory with Lua files in it.
/// The caller must hold onto the `Project` to keep the directory alive.
pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn with_file(self, name: &str, text: &str) -> Self {
        self.write(name, text);
        self
    }

    pub fn write(&self, name: &str, text: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, text).unwrap();
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Normalized path the engine uses for `name`.
    pub fn path(&self, name: &str) -> String {
        covlua::paths::normalize_path(name, self.root())
    }

    pub fn config(&self) -> Config {
        Config::default().with_root(self.root())
    }

    pub fn session(&self, strategy: Strategy) -> Session {
        Session::new(self.config(), strategy).unwrap()
    }
}

/// Feed line hooks for `name` the way an interpreter running it would.
pub fn trace_lines(session: &mut Session, name: &str, lines: &[u32]) {
    let source = format!("@{name}");
    for &line in lines {
        session.on_event(HostEvent::Line { source: &source, line });
    }
}

/// Feed top-level `hit` calls for `lines`.
pub fn hit_lines(session: &mut Session, path: &str, lines: &[u32]) {
    for &line in lines {
        session.on_event(HostEvent::Hit {
            file: path,
            line,
            block: BlockId::ROOT,
        });
    }
}

/// Feed the `hit` calls `module` makes when `lines` run, in order: every
/// call injected on each line except those inside the `skip` blocks.
pub fn run_module(session: &mut Session, module: &LoadedModule, lines: &[u32], skip: &[BlockId]) {
    for &line in lines {
        let sites = module.instrumented.sites.iter().filter(|s| s.line == line);
        for site in sites.filter(|s| !skip.contains(&s.block)) {
            session.on_event(HostEvent::Hit {
                file: &module.path,
                line,
                block: site.block,
            });
        }
    }
}
