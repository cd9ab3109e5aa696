//! Code-block language table.
//!
//! The remote service identifies code-block languages by integer. The table
//! is fixed by the service; both sync directions go through it.

/// Plaintext, the remote default for unknown language names.
pub const LANG_PLAINTEXT: u32 = 1;

const LANGUAGES: &[(u32, &str)] = &[
    (1, "plaintext"),
    (2, "abap"),
    (3, "ada"),
    (4, "apache"),
    (5, "apex"),
    (6, "assembly"),
    (7, "bash"),
    (8, "basic"),
    (9, "c"),
    (10, "clojure"),
    (11, "coffeescript"),
    (12, "cpp"),
    (13, "csharp"),
    (14, "css"),
    (15, "d"),
    (16, "dart"),
    (17, "delphi"),
    (18, "django"),
    (19, "dockerfile"),
    (20, "elixir"),
    (21, "elm"),
    (22, "erlang"),
    (23, "fortran"),
    (24, "fsharp"),
    (25, "go"),
    (26, "graphql"),
    (27, "groovy"),
    (28, "haskell"),
    (29, "html"),
    (30, "java"),
    (31, "javascript"),
    (32, "json"),
    (33, "julia"),
    (34, "kotlin"),
    (35, "latex"),
    (36, "lisp"),
    (37, "lua"),
    (38, "makefile"),
    (39, "markdown"),
    (40, "matlab"),
    (41, "nginx"),
    (42, "objectivec"),
    (43, "ocaml"),
    (44, "pascal"),
    (45, "perl"),
    (46, "php"),
    (47, "powershell"),
    (48, "prolog"),
    (49, "python"),
    (50, "r"),
    (51, "ruby"),
    (52, "rust"),
    (53, "scala"),
    (54, "scheme"),
    (55, "scss"),
    (56, "shell"),
    (57, "sql"),
    (58, "swift"),
    (59, "typescript"),
    (60, "vb"),
    (61, "vue"),
    (62, "xml"),
    (63, "yaml"),
];

/// Language name for a remote code. Unknown codes emit no fence language.
pub fn language_name(code: u32) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Remote code for a fence info string. Unknown names map to plaintext.
pub fn language_code(name: &str) -> u32 {
    let name = name.trim().to_ascii_lowercase();
    if name.is_empty() {
        return LANG_PLAINTEXT;
    }
    LANGUAGES
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(c, _)| *c)
        .unwrap_or(LANG_PLAINTEXT)
}
