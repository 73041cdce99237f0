//! Source-index (srcsrv) sections embedded into stored symbol files.

use std::fmt;

const INI_HEADER: &str = "SRCSRV: ini ------------------------------------------------";
const VARIABLES_HEADER: &str = "SRCSRV: variables ------------------------------------------";
const SOURCES_HEADER: &str = "SRCSRV: source files ---------------------------------------";
const END_HEADER: &str = "SRCSRV: end ------------------------------------------------";

/// Marker that starts a section inside a symbol file
pub const SECTION_MARKER: &[u8] = b"SRCSRV: ini";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SrcSrvSection {
    pub ini: Vec<(String, String)>,
    pub variables: Vec<(String, String)>,
    pub sources: Vec<Vec<String>>,
}

enum Part {
    None,
    Ini,
    Variables,
    Sources,
}

impl SrcSrvSection {
    /// Section pointing a debugger at `{public_url}/src/...` for every source.
    pub fn for_server(public_url: &str) -> Self {
        let public_url = public_url.trim_end_matches('/');
        let mut section = Self::default();
        section.add_ini("VERSION", "2");
        section.add_ini("INDEXVERSION", "2");
        section.add_variable(
            "SRCSRVTRG",
            format!("{}/src/%fnfile%(%var1%)/%var2%/%fnfile%(%var1%)", public_url),
        );
        section.add_variable("SRCSRVCMD", "");
        section.add_variable("SRCSRVVERCTRL", "http");
        section.add_ini("VERCTRL", "http");
        section
    }

    pub fn add_ini(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ini.push((key.into(), value.into()));
    }

    pub fn add_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.push((key.into(), value.into()));
    }

    pub fn add_source(&mut self, original_path: &str, hash: &str) {
        self.sources
            .push(vec![original_path.to_string(), hash.to_string()]);
    }

    pub fn parse(text: &str) -> Self {
        let mut section = Self::default();
        let mut part = Part::None;

        for line in text.lines().map(str::trim_end) {
            if let Some(header) = line.strip_prefix("SRCSRV: ") {
                part = match header.split_whitespace().next() {
                    Some("ini") => Part::Ini,
                    Some("variables") => Part::Variables,
                    Some("source") => Part::Sources,
                    _ => Part::None,
                };
                continue;
            }
            if line.is_empty() {
                continue;
            }

            match part {
                Part::Ini => {
                    if let Some((key, value)) = line.split_once('=') {
                        section.add_ini(key, value);
                    }
                }
                Part::Variables => {
                    if let Some((key, value)) = line.split_once('=') {
                        section.add_variable(key, value);
                    }
                }
                Part::Sources => section
                    .sources
                    .push(line.split('*').map(str::to_string).collect()),
                Part::None => {}
            }
        }

        section
    }
}

impl fmt::Display for SrcSrvSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", INI_HEADER)?;
        for (key, value) in &self.ini {
            writeln!(f, "{}={}", key, value)?;
        }
        writeln!(f, "{}", VARIABLES_HEADER)?;
        for (key, value) in &self.variables {
            writeln!(f, "{}={}", key, value)?;
        }
        writeln!(f, "{}", SOURCES_HEADER)?;
        for source in &self.sources {
            writeln!(f, "{}", source.join("*"))?;
        }
        writeln!(f, "{}", END_HEADER)
    }
}

/// Position of an embedded section, if any
pub fn find_section(data: &[u8]) -> Option<usize> {
    data.windows(SECTION_MARKER.len())
        .position(|window| window == SECTION_MARKER)
}
