//! Pure name-derivation pipeline for events and consumers.
//!
//! Every public function here is a pure function of its inputs: given the
//! same type name, override, and [`NamingOptions`], the derived name is
//! always the same string (see the idempotence invariant in the crate's
//! testable-properties section). Nothing in this module touches the
//! registration store or performs I/O.

/// Word-separator convention used when joining tokenized name parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Convention {
    /// `kebab-case`
    KebabCase,
    /// `snake_case`
    SnakeCase,
    /// `dot.case`
    DotCase,
}

impl Convention {
    /// The separator character this convention joins words with.
    #[must_use]
    pub const fn separator(self) -> char {
        match self {
            Self::KebabCase => '-',
            Self::SnakeCase => '_',
            Self::DotCase => '.',
        }
    }
}

/// Where a consumer's base name token comes from before any suffix is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerNameSource {
    /// Use the consumer type's derived name alone.
    TypeName,
    /// Use only the configured prefix.
    Prefix,
    /// Join the configured prefix and the consumer type's derived name.
    PrefixAndTypeName,
}

/// Naming configuration shared by every registration in a bus instance.
///
/// This is a plain builder-populated struct; loading it from a config file
/// or environment is left to the host application.
#[derive(Debug, Clone)]
pub struct NamingOptions {
    scope: Option<String>,
    convention: Convention,
    use_full_type_names: bool,
    consumer_name_source: ConsumerNameSource,
    consumer_name_prefix: Option<String>,
    suffix_consumer_name: bool,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            scope: None,
            convention: Convention::KebabCase,
            use_full_type_names: false,
            consumer_name_source: ConsumerNameSource::TypeName,
            consumer_name_prefix: None,
            suffix_consumer_name: false,
        }
    }
}

impl NamingOptions {
    /// Start building naming options from defaults (kebab-case, no scope).
    #[must_use]
    pub fn builder() -> NamingOptionsBuilder {
        NamingOptionsBuilder::default()
    }

    /// The effective consumer-name prefix, falling back to `application_name`
    /// when no explicit prefix was configured.
    #[must_use]
    pub fn effective_consumer_prefix<'a>(&'a self, application_name: &'a str) -> &'a str {
        self.consumer_name_prefix
            .as_deref()
            .unwrap_or(application_name)
    }
}

/// Builder for [`NamingOptions`].
#[derive(Debug, Clone, Default)]
pub struct NamingOptionsBuilder {
    scope: Option<String>,
    convention: Option<Convention>,
    use_full_type_names: Option<bool>,
    consumer_name_source: Option<ConsumerNameSource>,
    consumer_name_prefix: Option<String>,
    suffix_consumer_name: Option<bool>,
}

impl NamingOptionsBuilder {
    /// Set an optional scope prefix applied to every derived name.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the word-joining convention.
    #[must_use]
    pub const fn convention(mut self, convention: Convention) -> Self {
        self.convention = Some(convention);
        self
    }

    /// Use the fully qualified type path instead of the simple type name.
    #[must_use]
    pub const fn use_full_type_names(mut self, use_full: bool) -> Self {
        self.use_full_type_names = Some(use_full);
        self
    }

    /// Set where the consumer name's base token is sourced from.
    #[must_use]
    pub const fn consumer_name_source(mut self, source: ConsumerNameSource) -> Self {
        self.consumer_name_source = Some(source);
        self
    }

    /// Set an explicit consumer name prefix (defaults to the application name).
    #[must_use]
    pub fn consumer_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_name_prefix = Some(prefix.into());
        self
    }

    /// Append the event name to the consumer name when true.
    #[must_use]
    pub const fn suffix_consumer_name(mut self, suffix: bool) -> Self {
        self.suffix_consumer_name = Some(suffix);
        self
    }

    /// Build the [`NamingOptions`].
    #[must_use]
    pub fn build(self) -> NamingOptions {
        NamingOptions {
            scope: self.scope,
            convention: self.convention.unwrap_or(Convention::KebabCase),
            use_full_type_names: self.use_full_type_names.unwrap_or(false),
            consumer_name_source: self
                .consumer_name_source
                .unwrap_or(ConsumerNameSource::TypeName),
            consumer_name_prefix: self.consumer_name_prefix,
            suffix_consumer_name: self.suffix_consumer_name.unwrap_or(false),
        }
    }
}

/// Strip a Rust-style generic argument list (`Foo<Bar, Baz>`) from a type path.
///
/// This is the Rust analogue of stripping a source-language generic-arity
/// suffix (e.g. `` Foo`1 `` in other runtimes): `std::any::type_name` embeds
/// generic parameters inline rather than as a trailing arity marker, so the
/// equivalent normalization is to drop everything from the first `<` onward.
fn strip_generic_arity(raw: &str) -> &str {
    raw.split('<').next().unwrap_or(raw)
}

/// Split a (possibly module-qualified) type path into naming tokens.
///
/// `use_full`: when `false`, only the last path segment (simple type name) is
/// tokenized; when `true`, every path segment contributes tokens.
#[must_use]
pub fn tokenize_type_name(raw: &str, use_full: bool) -> Vec<String> {
    let stripped = strip_generic_arity(raw);
    let path_sep_normalized = stripped.replace("::", ".");
    let segment = if use_full {
        path_sep_normalized.as_str()
    } else {
        path_sep_normalized
            .rsplit('.')
            .next()
            .unwrap_or(&path_sep_normalized)
    };

    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_is_lower = false;

    for ch in segment.chars() {
        if ch.is_alphanumeric() {
            let is_upper = ch.is_uppercase();
            if is_upper && prev_is_lower && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            current.push(ch.to_ascii_lowercase());
            prev_is_lower = !is_upper;
        } else {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_is_lower = false;
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

/// Join tokens with the convention's separator.
#[must_use]
pub fn join_words(words: &[String], convention: Convention) -> String {
    words.join(&convention.separator().to_string())
}

/// Replace any character outside `[A-Za-z0-9]` and the chosen separator with
/// that separator, then collapse repeated separators into one.
#[must_use]
pub fn sanitize(raw: &str, separator: char) -> String {
    let mut replaced = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == separator {
            replaced.push(ch);
        } else {
            replaced.push(separator);
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut last_was_sep = false;
    for ch in replaced.chars() {
        if ch == separator {
            if !last_was_sep {
                collapsed.push(ch);
            }
            last_was_sep = true;
        } else {
            collapsed.push(ch);
            last_was_sep = false;
        }
    }
    collapsed.trim_matches(separator).to_string()
}

/// Derive the stable on-the-wire event name for a type.
///
/// `override_name`, when present, replaces the type-derived token entirely
/// but is still sanitized for invalid characters (never re-cased).
#[must_use]
pub fn derive_event_name(
    type_name: &str,
    override_name: Option<&str>,
    options: &NamingOptions,
) -> String {
    let separator = options.convention.separator();
    let base = if let Some(raw) = override_name {
        sanitize(raw, separator)
    } else {
        let words = tokenize_type_name(type_name, options.use_full_type_names);
        join_words(&words, options.convention)
    };

    let with_scope = match &options.scope {
        Some(scope) if !scope.is_empty() => {
            format!("{}{separator}{base}", sanitize(scope, separator))
        }
        _ => base,
    };

    sanitize(&with_scope, separator)
}

/// Derive the stable on-the-wire consumer name for a consumer type bound to
/// `event_name`.
#[must_use]
pub fn derive_consumer_name(
    consumer_type_name: &str,
    event_name: &str,
    override_name: Option<&str>,
    application_name: &str,
    options: &NamingOptions,
) -> String {
    let separator = options.convention.separator();

    let type_token = if let Some(raw) = override_name {
        sanitize(raw, separator)
    } else {
        let words = tokenize_type_name(consumer_type_name, options.use_full_type_names);
        join_words(&words, options.convention)
    };

    let prefix = options.effective_consumer_prefix(application_name);
    let prefix_token = sanitize(prefix, separator);

    let base = match options.consumer_name_source {
        ConsumerNameSource::TypeName => type_token,
        ConsumerNameSource::Prefix => prefix_token,
        ConsumerNameSource::PrefixAndTypeName => {
            format!("{prefix_token}{separator}{type_token}")
        }
    };

    let with_suffix = if options.suffix_consumer_name {
        format!("{base}{separator}{event_name}")
    } else {
        base
    };

    sanitize(&with_suffix, separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_scope_short_type_name() {
        let options = NamingOptions::builder().scope("dev").build();
        let name = derive_event_name("TestEvent1", None, &options);
        assert_eq!(name, "dev-test-event1");
    }

    #[test]
    fn kebab_scope_full_type_name() {
        let options = NamingOptions::builder()
            .scope("dev")
            .use_full_type_names(true)
            .build();
        let name = derive_event_name("tingle::event::bus::tests::TestEvent1", None, &options);
        assert_eq!(name, "dev-tingle-event-bus-tests-test-event1");
    }

    #[test]
    fn override_bypasses_convention_but_is_sanitized() {
        let options = NamingOptions::builder().convention(Convention::SnakeCase).build();
        let name = derive_event_name("TestEvent1", Some("sample-event"), &options);
        assert_eq!(name, "sample-event");
    }

    #[test]
    fn consumer_prefix_and_type_name_with_suffix() {
        let options = NamingOptions::builder()
            .consumer_name_source(ConsumerNameSource::PrefixAndTypeName)
            .consumer_name_prefix("service1")
            .suffix_consumer_name(true)
            .build();

        let event_name = derive_event_name("TestEvent1", None, &options);
        let consumer_name =
            derive_consumer_name("TestConsumer1", &event_name, None, "fallback-app", &options);

        assert_eq!(consumer_name, "service1-test-consumer1-test-event1");
    }

    #[test]
    fn invalid_characters_are_replaced_and_collapsed() {
        let name = sanitize("foo!!bar__baz", '-');
        assert_eq!(name, "foo-bar-baz");
    }

    #[test]
    fn derivation_is_idempotent() {
        let options = NamingOptions::builder().scope("dev").build();
        let first = derive_event_name("TestEvent1", None, &options);
        let second = derive_event_name("TestEvent1", None, &options);
        assert_eq!(first, second);
    }
}
