//! Scopes of the run → group → case hierarchy and the tree holding them.
//!
//! A *group* is a pytest test class, identified by its fully qualified name
//! (the file path with `/` turned into `.` and the `.py` suffix dropped,
//! followed by the class name). A *case* is one test in a group, identified
//! by its test name including any parameterization suffix
//! (`test_a[variant]`).
//!
//! The tree is populated from static discovery before a session and grows
//! while the session runs: tests that pytest executes without having been
//! discovered (generated parameters, reruns) are registered dynamically.
//! Nothing is ever removed.

use std::collections::HashMap;
use std::fmt;

/// Display name of the run scope.
pub const RUN_NAME: &str = "pytest";

/// Identity of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeId {
    Run,
    Group(String),
    Case { group: String, test: String },
}

impl ScopeId {
    /// Identity of a group.
    pub fn group(name: impl Into<String>) -> Self {
        ScopeId::Group(name.into())
    }

    /// Identity of a case within a group.
    pub fn case(group: impl Into<String>, test: impl Into<String>) -> Self {
        ScopeId::Case {
            group: group.into(),
            test: test.into(),
        }
    }

    /// Position in the hierarchy: 0 for the run, 1 for groups, 2 for cases.
    pub fn depth(&self) -> usize {
        match self {
            ScopeId::Run => 0,
            ScopeId::Group(_) => 1,
            ScopeId::Case { .. } => 2,
        }
    }

    /// Name of the group this scope belongs to, if any.
    pub fn group_name(&self) -> Option<&str> {
        match self {
            ScopeId::Run => None,
            ScopeId::Group(group) | ScopeId::Case { group, .. } => Some(group),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Run => write!(f, "[engine:{RUN_NAME}]"),
            ScopeId::Group(group) => write!(f, "[engine:{RUN_NAME}]/[class:{group}]"),
            ScopeId::Case { group, test } => {
                write!(f, "[engine:{RUN_NAME}]/[class:{group}]/[case:{test}]")
            }
        }
    }
}

/// A node of the scope tree as seen by listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    id: ScopeId,
    display_name: String,
    file: Option<String>,
    selector: Option<String>,
}

impl Scope {
    fn run() -> Self {
        Self {
            id: ScopeId::Run,
            display_name: RUN_NAME.to_string(),
            file: None,
            selector: None,
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    /// Name shown in reports: the qualified group name or the test name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Source file relative to the pytest root directory.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// pytest argument selecting this scope, e.g. `tests/pkg.py::Thing`.
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref()
    }

    /// For cases, the test name without the parameterization suffix.
    pub fn method_name(&self) -> Option<&str> {
        match &self.id {
            ScopeId::Case { test, .. } => Some(test.split('[').next().unwrap_or(test)),
            _ => None,
        }
    }
}

/// One collected pytest test: `file::Class::method::test`.
///
/// # Example
///
/// ```
/// use pytest_bridge::scope::CollectEntry;
///
/// let entry = CollectEntry::parse("dir/some_file.py::FooTest::test_a::test_a[x]").unwrap();
/// assert_eq!(entry.qualified_name(), "dir.some_file.FooTest");
/// assert_eq!(entry.method(), "test_a");
/// assert_eq!(entry.test(), "test_a[x]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectEntry {
    file: String,
    simple_name: String,
    method: String,
    test: String,
    qualified_name: String,
}

impl CollectEntry {
    pub fn new(
        file: impl Into<String>,
        simple_name: impl Into<String>,
        method: impl Into<String>,
        test: impl Into<String>,
    ) -> Self {
        let file = file.into();
        let simple_name = simple_name.into();
        let package = file.replace('/', ".");
        let package = package.strip_suffix(".py").unwrap_or(&package);
        let qualified_name = format!("{package}.{simple_name}");
        Self {
            file,
            simple_name,
            method: method.into(),
            test: test.into(),
            qualified_name,
        }
    }

    /// Parses a line printed by the plugin in collect-only mode.
    ///
    /// Returns `None` for anything that is not a four-part entry, and for
    /// entries whose container is the placeholder `cls`.
    pub fn parse(line: &str) -> Option<Self> {
        let (file, rest) = line.split_once("::")?;
        let (simple_name, rest) = rest.split_once("::")?;
        if simple_name == "cls" {
            return None;
        }
        let (method, test) = rest.split_once("::")?;
        Some(Self::new(file, simple_name, method, test))
    }

    /// Builds an entry from the identity fields of a `runtest_logstart`
    /// message.
    ///
    /// `nodeid` must be `file::Class::method`; the test name is the part of
    /// `domain` after its first `.` (`Class.test_a[x]` → `test_a[x]`).
    pub fn from_report(nodeid: &str, _fspath: &str, domain: &str) -> Option<Self> {
        let (file, rest) = nodeid.split_once("::")?;
        let (simple_name, method) = rest.split_once("::")?;
        let (_, test) = domain.split_once('.')?;
        Some(Self::new(file, simple_name, method, test))
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn simple_name(&self) -> &str {
        &self.simple_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn test(&self) -> &str {
        &self.test
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }
}

impl fmt::Display for CollectEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}::{}",
            self.file, self.simple_name, self.method, self.test
        )
    }
}

/// A group and its cases.
#[derive(Debug, Clone)]
pub struct GroupNode {
    scope: Scope,
    cases: Vec<Scope>,
    case_index: HashMap<String, usize>,
}

impl GroupNode {
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Cases in registration order.
    pub fn cases(&self) -> &[Scope] {
        &self.cases
    }

    pub fn case(&self, test: &str) -> Option<&Scope> {
        self.case_index.get(test).map(|&i| &self.cases[i])
    }
}

/// The known scopes of a session.
#[derive(Debug, Clone)]
pub struct ScopeTree {
    root: Scope,
    groups: Vec<GroupNode>,
    group_index: HashMap<String, usize>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// Creates a tree containing only the run scope.
    pub fn new() -> Self {
        Self {
            root: Scope::run(),
            groups: Vec::new(),
            group_index: HashMap::new(),
        }
    }

    /// Builds a tree from collected entries.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CollectEntry>) -> Self {
        let mut tree = Self::new();
        for entry in entries {
            tree.insert(entry);
        }
        tree
    }

    pub fn root(&self) -> &Scope {
        &self.root
    }

    /// Groups in registration order.
    pub fn groups(&self) -> &[GroupNode] {
        &self.groups
    }

    pub fn group(&self, qualified_name: &str) -> Option<&GroupNode> {
        self.group_index
            .get(qualified_name)
            .map(|&i| &self.groups[i])
    }

    /// Total number of cases.
    pub fn case_count(&self) -> usize {
        self.groups.iter().map(|g| g.cases.len()).sum()
    }

    /// Looks up any scope by identity.
    pub fn scope(&self, id: &ScopeId) -> Option<&Scope> {
        match id {
            ScopeId::Run => Some(&self.root),
            ScopeId::Group(group) => self.group(group).map(GroupNode::scope),
            ScopeId::Case { group, test } => self.group(group)?.case(test),
        }
    }

    /// Registers the group and case of a collected entry.
    ///
    /// Returns the case identity. Existing scopes are left untouched.
    pub fn insert(&mut self, entry: &CollectEntry) -> ScopeId {
        self.add_group(entry);
        let (id, _) = self.add_case(entry.qualified_name(), entry.test());
        id
    }

    /// Registers the group of `entry` if it is unknown.
    ///
    /// Returns the group identity and whether it was newly added.
    pub fn add_group(&mut self, entry: &CollectEntry) -> (ScopeId, bool) {
        let id = ScopeId::group(entry.qualified_name());
        if self.group_index.contains_key(entry.qualified_name()) {
            return (id, false);
        }

        let scope = Scope {
            id: id.clone(),
            display_name: entry.qualified_name().to_string(),
            file: Some(entry.file().to_string()),
            selector: Some(format!("{}::{}", entry.file(), entry.simple_name())),
        };
        self.group_index
            .insert(entry.qualified_name().to_string(), self.groups.len());
        self.groups.push(GroupNode {
            scope,
            cases: Vec::new(),
            case_index: HashMap::new(),
        });
        (id, true)
    }

    /// Registers a case in an existing group if it is unknown.
    ///
    /// Returns the case identity and whether it was newly added. Adding a
    /// case to an unknown group registers nothing.
    pub fn add_case(&mut self, group: &str, test: &str) -> (ScopeId, bool) {
        let id = ScopeId::case(group, test);
        let Some(&index) = self.group_index.get(group) else {
            return (id, false);
        };
        let node = &mut self.groups[index];
        if node.case_index.contains_key(test) {
            return (id, false);
        }

        let scope = Scope {
            id: id.clone(),
            display_name: test.to_string(),
            file: node.scope.file.clone(),
            selector: node.scope.selector.as_ref().map(|s| format!("{s}::{test}")),
        };
        node.case_index.insert(test.to_string(), node.cases.len());
        node.cases.push(scope);
        (id, true)
    }

    /// pytest arguments selecting every known group.
    pub fn selectors(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter_map(|g| g.scope.selector.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_collect_lines() {
        assert_eq!(CollectEntry::parse(""), None);
        assert_eq!(CollectEntry::parse("  Foo Bar"), None);
        assert_eq!(CollectEntry::parse("some.py::SomeClass"), None);
        assert_eq!(
            CollectEntry::parse("some.py::cls::test_method::test_method"),
            None
        );

        let entry = CollectEntry::parse("some_file.py::FooTest::test_a::test_a").unwrap();
        assert_eq!(entry.file(), "some_file.py");
        assert_eq!(entry.simple_name(), "FooTest");
        assert_eq!(entry.method(), "test_a");
        assert_eq!(entry.test(), "test_a");
        assert_eq!(entry.qualified_name(), "some_file.FooTest");
        assert_eq!(entry.to_string(), "some_file.py::FooTest::test_a::test_a");

        let entry =
            CollectEntry::parse("dir_one/two/some_file.py::FooTest::test_a::test_a[some,thing]")
                .unwrap();
        assert_eq!(entry.qualified_name(), "dir_one.two.some_file.FooTest");
        assert_eq!(entry.test(), "test_a[some,thing]");
    }

    #[test]
    fn test_entry_from_report() {
        let entry =
            CollectEntry::from_report("tests/pkg.py::Thing::test_b[x]", "tests/pkg.py", "Thing.test_b[x]")
                .unwrap();
        assert_eq!(entry.qualified_name(), "tests.pkg.Thing");
        assert_eq!(entry.method(), "test_b[x]");
        assert_eq!(entry.test(), "test_b[x]");

        assert!(CollectEntry::from_report("tests/pkg.py::test_fn", "tests/pkg.py", "test_fn").is_none());
        assert!(CollectEntry::from_report("tests/pkg.py::Thing::b", "tests/pkg.py", "nodot").is_none());
    }

    #[test]
    fn test_tree_registration_is_idempotent() {
        let entry = CollectEntry::new("pkg.py", "Thing", "a", "a");
        let mut tree = ScopeTree::new();

        assert_eq!(tree.add_group(&entry), (ScopeId::group("pkg.Thing"), true));
        assert_eq!(tree.add_group(&entry), (ScopeId::group("pkg.Thing"), false));
        assert_eq!(tree.add_case("pkg.Thing", "a"), (ScopeId::case("pkg.Thing", "a"), true));
        assert_eq!(tree.add_case("pkg.Thing", "a").1, false);
        assert_eq!(tree.add_case("unknown.Group", "a").1, false);

        assert_eq!(tree.groups().len(), 1);
        assert_eq!(tree.case_count(), 1);
    }

    #[test]
    fn test_scope_lookup_and_selectors() {
        let entries = [
            CollectEntry::new("tests/a.py", "A", "t1", "t1[p]"),
            CollectEntry::new("tests/a.py", "A", "t2", "t2"),
            CollectEntry::new("tests/b.py", "B", "t", "t"),
        ];
        let tree = ScopeTree::from_entries(&entries);

        let case = tree.scope(&ScopeId::case("tests.a.A", "t1[p]")).unwrap();
        assert_eq!(case.display_name(), "t1[p]");
        assert_eq!(case.method_name(), Some("t1"));
        assert_eq!(case.selector(), Some("tests/a.py::A::t1[p]"));
        assert_eq!(case.file(), Some("tests/a.py"));

        assert_eq!(tree.scope(&ScopeId::Run).unwrap().display_name(), RUN_NAME);
        assert!(tree.scope(&ScopeId::case("tests.a.A", "nope")).is_none());
        assert_eq!(
            tree.selectors(),
            vec!["tests/a.py::A".to_string(), "tests/b.py::B".to_string()]
        );
    }

    #[test]
    fn test_scope_id_display() {
        assert_eq!(
            ScopeId::case("pkg.Thing", "a").to_string(),
            "[engine:pytest]/[class:pkg.Thing]/[case:a]"
        );
        assert_eq!(ScopeId::case("g", "c").depth(), 2);
        assert_eq!(ScopeId::Run.group_name(), None);
    }
}
