//! Line commands for the headless editor.
//!
//! Each line maps to one store mutation or one lifecycle signal, which is
//! enough to drive a session by hand or from a script.

use pagebuilder_core::{NewSection, SectionType, SectionsStore, TabsStore};
use pagebuilder_persist::{LifecycleEvent, Visibility};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Tabs,
    AddTab(String),
    RemoveTab(String),
    Select(String),
    Sections(Option<String>),
    AddSection {
        tab_id: String,
        kind: SectionType,
        name: String,
    },
    /// Forward a lifecycle signal to the orchestrator.
    Signal(LifecycleEvent),
    Sync,
    Quit,
}

pub const HELP: &str = "\
tabs                            list tabs
add-tab <name>                  add a tab
remove-tab <id>                 remove a tab and its sections
select <id>                     make a tab active
sections [tab-id]               list sections
add-section <tab-id> <text|table> <name>
hide | show | pagehide | unload emit a lifecycle event
sync                            write a snapshot now
quit                            flush and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (try `help`)", self.0)
    }
}

impl std::error::Error for ParseError {}

fn required(rest: &str, what: &str) -> Result<String, ParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ParseError(format!("missing {what}")));
    }
    Ok(rest.to_string())
}

impl Command {
    /// Parse one input line. Blank lines are `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

        let command = match verb {
            "help" | "?" => Command::Help,
            "tabs" => Command::Tabs,
            "add-tab" => Command::AddTab(required(rest, "tab name")?),
            "remove-tab" => Command::RemoveTab(required(rest, "tab id")?),
            "select" => Command::Select(required(rest, "tab id")?),
            "sections" => {
                let tab = rest.trim();
                Command::Sections((!tab.is_empty()).then(|| tab.to_string()))
            }
            "add-section" => {
                let mut parts = rest.trim().splitn(3, char::is_whitespace);
                let tab_id = parts.next().filter(|s| !s.is_empty());
                let kind = parts.next();
                let name = parts.next().map(str::trim).filter(|s| !s.is_empty());
                let (Some(tab_id), Some(kind), Some(name)) = (tab_id, kind, name) else {
                    return Err(ParseError(
                        "usage: add-section <tab-id> <text|table> <name>".into(),
                    ));
                };
                let kind = match kind {
                    "text" => SectionType::Text,
                    "table" => SectionType::Table,
                    other => return Err(ParseError(format!("unknown section type '{other}'"))),
                };
                Command::AddSection {
                    tab_id: tab_id.to_string(),
                    kind,
                    name: name.to_string(),
                }
            }
            "hide" => Command::Signal(LifecycleEvent::VisibilityChange(Visibility::Hidden)),
            "show" => Command::Signal(LifecycleEvent::VisibilityChange(Visibility::Visible)),
            "pagehide" => Command::Signal(LifecycleEvent::PageHide),
            "unload" => Command::Signal(LifecycleEvent::BeforeUnload),
            "sync" => Command::Sync,
            "quit" | "exit" => Command::Quit,
            other => return Err(ParseError(format!("unknown command '{other}'"))),
        };
        Ok(Some(command))
    }
}

/// Apply a store command and describe the result. Commands that need the
/// orchestrator (`Signal`, `Sync`, `Quit`) are left to the caller.
pub fn apply(command: &Command, tabs: &TabsStore, sections: &SectionsStore) -> Vec<String> {
    match command {
        Command::Help => HELP.lines().map(str::to_string).collect(),
        Command::Tabs => {
            let active = tabs.active_tab_id();
            tabs.tabs_list()
                .into_iter()
                .map(|t| {
                    let marker = if active.as_deref() == Some(t.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    format!("{marker} {}  {}  {}", t.id, t.name, t.slug)
                })
                .collect()
        }
        Command::AddTab(name) => {
            let tab = tabs.add(name);
            vec![format!("added tab {} ({})", tab.id, tab.slug)]
        }
        Command::RemoveTab(id) => match tabs.remove(id, sections) {
            Some(index) => vec![format!("removed tab at position {index}")],
            None => vec![format!("no tab {id}")],
        },
        Command::Select(id) => {
            tabs.set_active_tab(id.clone());
            match tabs.active_tab() {
                Some(tab) => vec![format!("active: {}", tab.name)],
                None => vec![format!("active id {id} matches no tab")],
            }
        }
        Command::Sections(tab) => {
            let list = match tab {
                Some(tab) => sections.tab_sections(tab),
                None => sections.sections(),
            };
            list.into_iter()
                .map(|s| format!("{}  [{}]  {:?}  {}", s.id, s.tab_id, s.kind, s.name))
                .collect()
        }
        Command::AddSection { tab_id, kind, name } => {
            let section = sections.add(NewSection::new(tab_id.clone(), name.clone(), *kind));
            vec![format!("added section {}", section.id)]
        }
        Command::Signal(_) | Command::Sync | Command::Quit => Vec::new(),
    }
}
