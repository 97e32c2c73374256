use std::{
    collections::HashMap, fmt, fs, os::unix::fs::PermissionsExt, path::Path, str::FromStr,
};

use serde_derive::{Deserialize, Serialize};

use crate::error::GraderCoreError;
use crate::run::executor::Executor;
use crate::run::sandbox::{Sandbox, TerminationCause};
use crate::run::ResourceLimits;
use crate::utils::{find_program, get_pathbuf_str};

const MAKEFILES: [&str; 3] = ["Makefile", "makefile", "GNUmakefile"];
const HEADER_EXTENSIONS: [&str; 2] = ["h", "hpp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    C,
    Cpp,
    Rust,
    Java,
    Python,
    Shell,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::C,
        Language::Cpp,
        Language::Rust,
        Language::Java,
        Language::Python,
        Language::Shell,
    ];
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::Python => "python",
            Self::Shell => "shell",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Self::C),
            "cpp" | "c++" | "cxx" => Ok(Self::Cpp),
            "rust" | "rs" => Ok(Self::Rust),
            "java" => Ok(Self::Java),
            "python" | "python3" | "py" => Ok(Self::Python),
            "shell" | "sh" => Ok(Self::Shell),
            _ => Err(anyhow::anyhow!("Language not found: {}", s)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// How one language is built and run.
///
/// Templates are argv lists. `{inputs}` as a whole element expands to the
/// source files, `{output}` and `{artifact_name}` become the artifact file
/// name and `{artifact}` its absolute path inside the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainSpec {
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub artifact: String,
    /// Root source file. When set, `{inputs}` is this file alone.
    #[serde(default)]
    pub entry: Option<String>,
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

impl ToolchainSpec {
    fn builtin(language: Language) -> Self {
        match language {
            Language::C => Self {
                compile: Some(argv(&["gcc", "-o", "{output}", "{inputs}"])),
                run: argv(&["{artifact}"]),
                extensions: argv(&["c"]),
                artifact: "main".to_string(),
                entry: None,
                limit_address_space: true,
            },
            Language::Cpp => Self {
                compile: Some(argv(&["g++", "-pthread", "-o", "{output}", "{inputs}"])),
                run: argv(&["{artifact}"]),
                extensions: argv(&["cpp", "cc", "cxx"]),
                artifact: "main".to_string(),
                entry: None,
                limit_address_space: true,
            },
            Language::Rust => Self {
                compile: Some(argv(&["rustc", "-O", "-o", "{output}", "{inputs}"])),
                run: argv(&["{artifact}"]),
                extensions: argv(&["rs"]),
                artifact: "main".to_string(),
                entry: Some("main.rs".to_string()),
                limit_address_space: true,
            },
            Language::Java => Self {
                compile: Some(argv(&["javac", "-d", ".", "{inputs}"])),
                run: argv(&["java", "-cp", ".", "{artifact_name}"]),
                extensions: argv(&["java"]),
                artifact: "Main".to_string(),
                entry: None,
                limit_address_space: false,
            },
            Language::Python => Self {
                compile: Some(argv(&["python3", "-m", "py_compile", "{inputs}"])),
                run: argv(&["python3", "{artifact}"]),
                extensions: argv(&["py"]),
                artifact: "main.py".to_string(),
                entry: Some("main.py".to_string()),
                limit_address_space: true,
            },
            Language::Shell => Self {
                compile: Some(argv(&["sh", "-n", "{inputs}"])),
                run: argv(&["sh", "{artifact}"]),
                extensions: argv(&["sh"]),
                artifact: "main.sh".to_string(),
                entry: Some("main.sh".to_string()),
                limit_address_space: true,
            },
        }
    }

    fn uses_artifact_path(&self) -> bool {
        self.run.iter().any(|part| part.contains("{artifact}"))
    }

    /// The artifact itself is the program, as for native binaries.
    fn runs_artifact_directly(&self) -> bool {
        self.run.first().map(String::as_str) == Some("{artifact}")
    }
}

/// Values substituted into toolchain templates.
#[derive(Debug, Clone)]
struct TemplateContext {
    inputs: Vec<String>,
    artifact_name: String,
    artifact_path: String,
}

impl TemplateContext {
    fn expand(&self, template: &[String]) -> Vec<String> {
        let mut expanded = Vec::with_capacity(template.len() + self.inputs.len());
        for part in template {
            if part == "{inputs}" {
                expanded.extend(self.inputs.iter().cloned());
                continue;
            }
            expanded.push(
                part.replace("{output}", &self.artifact_name)
                    .replace("{artifact_name}", &self.artifact_name)
                    .replace("{artifact}", &self.artifact_path),
            );
        }
        expanded
    }
}

/// Outcome of the build step of one job.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub succeeded: bool,
    pub build_log: String,
    /// Present iff the build succeeded.
    pub executor: Option<Executor>,
}

impl BuildOutput {
    fn failed(build_log: String) -> Self {
        Self {
            succeeded: false,
            build_log,
            executor: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ToolchainOverrides {
    #[serde(default)]
    make: Option<Vec<String>>,
    #[serde(default)]
    languages: HashMap<Language, ToolchainSpec>,
}

/// Toolchain table: the built-in language specs plus operator overrides.
#[derive(Debug, Clone)]
pub struct Toolchains {
    pub make: Vec<String>,
    pub languages: HashMap<Language, ToolchainSpec>,
}

impl Default for Toolchains {
    fn default() -> Self {
        Self {
            make: argv(&["make"]),
            languages: Language::ALL
                .iter()
                .map(|language| (*language, ToolchainSpec::builtin(*language)))
                .collect(),
        }
    }
}

impl Toolchains {
    /// Built-in table with the entries of a YAML document laid over it.
    pub fn from_yaml(content: &str) -> Result<Self, GraderCoreError> {
        let overrides: ToolchainOverrides = serde_yaml::from_str(content)?;
        let mut toolchains = Self::default();
        if let Some(make) = overrides.make {
            toolchains.make = make;
        }
        for (language, spec) in overrides.languages {
            log::info!("Toolchain for {} overridden: {:?}", language, spec);
            toolchains.languages.insert(language, spec);
        }
        Ok(toolchains)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, GraderCoreError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn get(&self, language: Language) -> Result<&ToolchainSpec, GraderCoreError> {
        self.languages
            .get(&language)
            .ok_or_else(|| GraderCoreError::InvalidJob(format!("no toolchain for {}", language)))
    }

    /// Languages whose every required program can be found on this host.
    pub fn available_languages(&self) -> Vec<Language> {
        Language::ALL
            .iter()
            .copied()
            .filter(|language| match self.get(*language) {
                Ok(spec) => spec
                    .compile
                    .iter()
                    .chain(std::iter::once(&spec.run))
                    .all(|template| required_program(template).map_or(true, program_exists)),
                Err(_) => false,
            })
            .collect()
    }

    /// Build the submission in the sandbox's working directory.
    ///
    /// A failed or timed out compiler run is a normal result with
    /// `succeeded == false`; a missing toolchain program is an error.
    pub fn build(
        &self,
        sandbox: &Sandbox,
        language: Language,
        artifact: Option<&str>,
        build_limits: &ResourceLimits,
    ) -> Result<BuildOutput, GraderCoreError> {
        let spec = self.get(language)?;
        let source_dir = sandbox.working_dir();

        let makefile = MAKEFILES
            .iter()
            .find(|name| source_dir.join(name).is_file());
        let inputs = if makefile.is_some() {
            vec![]
        } else {
            collect_inputs(source_dir, spec)?
        };

        let artifact_name = match (artifact, &spec.entry) {
            (Some(artifact), _) => artifact.to_string(),
            (None, Some(entry)) if *entry == spec.artifact => {
                inputs.first().cloned().unwrap_or_else(|| entry.clone())
            }
            _ => spec.artifact.clone(),
        };
        let context = TemplateContext {
            inputs,
            artifact_path: get_pathbuf_str(&source_dir.join(&artifact_name))?,
            artifact_name,
        };

        let build_command = match makefile {
            Some(name) => {
                log::debug!("Found {}, building with {:?}", name, self.make);
                Some(context.expand(&self.make))
            }
            None => match &spec.compile {
                Some(_) if context.inputs.is_empty() => {
                    return Ok(BuildOutput::failed(format!(
                        "No source files with extension {} found.",
                        spec.extensions
                            .iter()
                            .map(|extension| format!(".{}", extension))
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                }
                Some(template) => Some(context.expand(template)),
                None => None,
            },
        };

        let run_command = context.expand(&spec.run);
        for command in build_command.iter().chain(std::iter::once(&run_command)) {
            ensure_program(language, command)?;
        }

        let mut build_log = String::new();
        if let Some(command) = build_command {
            log::info!("Building {} submission: {:?}", language, command);
            let result = sandbox.run(&command, b"", build_limits, false)?;
            build_log = clean_build_log(&result.stdout, &result.stderr, source_dir);
            match result.termination {
                TerminationCause::Timeout { .. } => {
                    build_log.push_str(&format!(
                        "\nBuild timed out after {} seconds.",
                        build_limits.wall_seconds
                    ));
                    return Ok(BuildOutput::failed(build_log));
                }
                TerminationCause::Normal if result.exit_code == Some(0) => {}
                termination => {
                    log::debug!("Build failed: {:?} {:?}", termination, result.exit_code);
                    return Ok(BuildOutput::failed(build_log));
                }
            }
        }

        if spec.uses_artifact_path() && !Path::new(&context.artifact_path).exists() {
            build_log.push_str(&format!(
                "\nBuild produced no `{}` to run.",
                context.artifact_name
            ));
            return Ok(BuildOutput::failed(build_log));
        }
        if spec.runs_artifact_directly() && !is_executable(Path::new(&context.artifact_path)) {
            build_log.push_str(&format!(
                "\nBuild produced no executable `{}`.",
                context.artifact_name
            ));
            return Ok(BuildOutput::failed(build_log));
        }

        Ok(BuildOutput {
            succeeded: true,
            build_log,
            executor: Some(Executor::new(
                language,
                run_command,
                spec.limit_address_space,
            )),
        })
    }
}

fn is_executable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Top-level source files matching the language's extensions, headers omitted.
fn collect_inputs(source_dir: &Path, spec: &ToolchainSpec) -> Result<Vec<String>, GraderCoreError> {
    let mut inputs = vec![];
    for entry in fs::read_dir(source_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let extension = match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) => extension,
            None => continue,
        };
        if HEADER_EXTENSIONS.contains(&extension)
            || !spec.extensions.iter().any(|known| known == extension)
        {
            continue;
        }
        inputs.push(entry.file_name().to_string_lossy().into_owned());
    }
    inputs.sort();

    if let Some(entry) = &spec.entry {
        if inputs.iter().any(|input| input == entry) {
            return Ok(vec![entry.clone()]);
        }
        if inputs.len() > 1 {
            log::debug!("Entry {} missing, passing all of {:?}", entry, inputs);
        }
    }
    Ok(inputs)
}

fn required_program(template: &[String]) -> Option<&str> {
    template
        .first()
        .map(String::as_str)
        .filter(|program| !program.contains('{'))
}

fn program_exists(program: &str) -> bool {
    find_program(program).is_some()
}

fn ensure_program(language: Language, command: &[String]) -> Result<(), GraderCoreError> {
    match command.first() {
        Some(program) if Path::new(program).is_absolute() => Ok(()),
        Some(program) if !program_exists(program) => Err(GraderCoreError::ToolchainMissing {
            language,
            program: program.clone(),
        }),
        Some(_) => Ok(()),
        None => Err(GraderCoreError::InvalidJob(format!(
            "empty command template for {}",
            language
        ))),
    }
}

fn clean_build_log(stdout: &[u8], stderr: &[u8], source_dir: &Path) -> String {
    let mut log = String::from_utf8_lossy(stdout).into_owned();
    log.push_str(&String::from_utf8_lossy(stderr));
    let prefix = format!("{}/", source_dir.to_string_lossy());
    log.replace(&prefix, "")
}
