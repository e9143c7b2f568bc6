use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::players::PlayerHandle;

/// Who issued a command, as a capability tag.
#[derive(Clone)]
pub enum CommandSource {
    Console,
    Player(Arc<PlayerHandle>),
}

impl CommandSource {
    pub fn is_console(&self) -> bool {
        matches!(self, CommandSource::Console)
    }

    pub fn name(&self) -> &str {
        match self {
            CommandSource::Console => "console",
            CommandSource::Player(player) => &player.name,
        }
    }
}

pub trait CommandHandler: Send + Sync {
    fn execute(&self, source: &CommandSource, args: &[&str]);
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandSource, &[&str]) + Send + Sync,
{
    fn execute(&self, source: &CommandSource, args: &[&str]) {
        self(source, args)
    }
}

struct Registration {
    primary: String,
    handler: Arc<dyn CommandHandler>,
}

/// Administrative command registry. Built-in commands are registered
/// conditionally on config booleans and re-registered on reload.
pub struct CommandManager {
    commands: RwLock<HashMap<String, Arc<Registration>>>,
}

impl CommandManager {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn CommandHandler>,
        aliases: &[&str],
    ) {
        let registration = Arc::new(Registration {
            primary: name.to_lowercase(),
            handler,
        });
        let mut commands = self.commands.write();
        commands.insert(registration.primary.clone(), registration.clone());
        for alias in aliases {
            commands.insert(alias.to_lowercase(), registration.clone());
        }
    }

    /// Remove a command and every alias pointing at it.
    pub fn unregister(&self, name: &str) {
        let name = name.to_lowercase();
        let mut commands = self.commands.write();
        if let Some(registration) = commands.get(&name).cloned() {
            commands.retain(|_, r| !Arc::ptr_eq(r, &registration));
        }
    }

    pub fn clear(&self) {
        self.commands.write().clear();
    }

    /// Dispatch a raw command line. Returns `false` when no command matched.
    pub fn dispatch(&self, source: &CommandSource, line: &str) -> bool {
        let mut parts = line.trim().trim_start_matches('/').split_whitespace();
        let Some(name) = parts.next() else { return false };
        let args: Vec<&str> = parts.collect();
        let registration = self.commands.read().get(&name.to_lowercase()).cloned();
        match registration {
            Some(registration) => {
                registration.handler.execute(source, &args);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.commands.read().contains_key(&name.to_lowercase())
    }
}

impl Default for CommandManager {
    fn default() -> Self {
        Self::new()
    }
}
