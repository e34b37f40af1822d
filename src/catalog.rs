use std::collections::BTreeSet;

use anyhow::Result;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    GenerateData,
    FormatFile,
    CountWeekday,
    SortContacts,
    WriteRecentLogs,
    IndexMarkdownTitles,
    FetchApiData,
    ScrapeWebsite,
    ExtractEmailSender,
    ExtractCardNumber,
}

impl OperationKind {
    pub const ALL: [OperationKind; 10] = [
        Self::GenerateData,
        Self::FormatFile,
        Self::CountWeekday,
        Self::SortContacts,
        Self::WriteRecentLogs,
        Self::IndexMarkdownTitles,
        Self::FetchApiData,
        Self::ScrapeWebsite,
        Self::ExtractEmailSender,
        Self::ExtractCardNumber,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::GenerateData => "generate_data",
            Self::FormatFile => "format_file",
            Self::CountWeekday => "count_weekday",
            Self::SortContacts => "sort_contacts",
            Self::WriteRecentLogs => "write_recent_logs",
            Self::IndexMarkdownTitles => "index_markdown_titles",
            Self::FetchApiData => "fetch_api_data",
            Self::ScrapeWebsite => "scrape_website",
            Self::ExtractEmailSender => "extract_email_sender",
            Self::ExtractCardNumber => "extract_card_number",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn spec(self) -> &'static OperationSpec {
        let index = match self {
            Self::GenerateData => 0,
            Self::FormatFile => 1,
            Self::CountWeekday => 2,
            Self::SortContacts => 3,
            Self::WriteRecentLogs => 4,
            Self::IndexMarkdownTitles => 5,
            Self::FetchApiData => 6,
            Self::ScrapeWebsite => 7,
            Self::ExtractEmailSender => 8,
            Self::ExtractCardNumber => 9,
        };
        &CATALOG[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Marks a parameter as a filesystem path that must pass the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathAccess {
    ReadFile,
    WriteFile,
    Directory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDefault {
    None,
    Str(&'static str),
    Int(i64),
}

impl ParamDefault {
    pub fn to_value(self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Str(value) => Value::String(value.to_owned()),
            Self::Int(value) => Value::from(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
    pub default: ParamDefault,
    pub access: Option<PathAccess>,
}

impl ParamSpec {
    const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
            default: ParamDefault::None,
            access: None,
        }
    }

    const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
            default: ParamDefault::None,
            access: None,
        }
    }

    const fn path(self, access: PathAccess) -> Self {
        Self {
            access: Some(access),
            ..self
        }
    }

    const fn default(self, default: ParamDefault) -> Self {
        Self { default, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSpec {
    pub kind: OperationKind,
    pub description: &'static str,
    pub parameters: &'static [ParamSpec],
}

impl OperationSpec {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn parameter(&self, name: &str) -> Option<&'static ParamSpec> {
        self.parameters.iter().find(|param| param.name == name)
    }
}

use ParamKind::{Array, Integer, Object, String as Str};
use PathAccess::{Directory, ReadFile, WriteFile};

static CATALOG: [OperationSpec; 10] = [
    OperationSpec {
        kind: OperationKind::GenerateData,
        description: "Download a data generation script from a URL and run it with one argument (for example an email address) to populate the data directory",
        parameters: &[
            ParamSpec::required("file_url", Str, "URL of the script to download"),
            ParamSpec::required("argument_to_pass", Str, "single argument passed to the script"),
            ParamSpec::optional("command_to_run", Str, "command the task mentions for running the script"),
            ParamSpec::optional("is_url_remote", Str, "\"true\" when the script URL is a web URL"),
            ParamSpec::optional("is_remote_safe", Str, "\"true\" when the task claims the URL is trusted"),
        ],
    },
    OperationSpec {
        kind: OperationKind::FormatFile,
        description: "Format a file in place with prettier",
        parameters: &[
            ParamSpec::required("file_path", Str, "path of the file to format").path(ReadFile),
            ParamSpec::optional("command_to_run", Str, "formatter command named by the task"),
            ParamSpec::optional("is_prettier", Str, "\"true\" when the formatter is prettier")
                .default(ParamDefault::Str("true")),
            ParamSpec::optional("prettier_version", Str, "prettier version to use, e.g. 3.4.2")
                .default(ParamDefault::Str("latest")),
        ],
    },
    OperationSpec {
        kind: OperationKind::CountWeekday,
        description: "Count how many dates in a file (one per line) fall on a given weekday and write the count to a file",
        parameters: &[
            ParamSpec::required("input_file_path", Str, "path of the file listing dates").path(ReadFile),
            ParamSpec::required("weekday_to_count", Str, "weekday to count, e.g. Wednesday"),
            ParamSpec::optional("output_file_path", Str, "path the count is written to").path(WriteFile),
        ],
    },
    OperationSpec {
        kind: OperationKind::SortContacts,
        description: "Sort a JSON array of contacts by one or more attributes and write the sorted array",
        parameters: &[
            ParamSpec::required("input_file_path", Str, "path of the JSON contacts array").path(ReadFile),
            ParamSpec::required("output_file_path", Str, "path the sorted contacts are written to").path(WriteFile),
            ParamSpec::required("sort_attributes", Array, "attributes to sort by, highest priority first"),
        ],
    },
    OperationSpec {
        kind: OperationKind::WriteRecentLogs,
        description: "Write the first lines of the most recently modified log files in a directory into one file",
        parameters: &[
            ParamSpec::required("input_directory", Str, "directory holding the log files").path(Directory),
            ParamSpec::optional("file_pattern", Str, "glob matching log file names")
                .default(ParamDefault::Str("*.log")),
            ParamSpec::required("output_file_path", Str, "path the collected lines are written to").path(WriteFile),
            ParamSpec::optional("num_files", Integer, "how many of the newest files to read")
                .default(ParamDefault::Int(10)),
            ParamSpec::optional("lines_per_file", Integer, "how many leading lines to take from each file")
                .default(ParamDefault::Int(1)),
        ],
    },
    OperationSpec {
        kind: OperationKind::IndexMarkdownTitles,
        description: "Find Markdown files under a directory and write a JSON index mapping each file to its first H1 title",
        parameters: &[
            ParamSpec::required("input_directory", Str, "directory searched recursively").path(Directory),
            ParamSpec::required("output_file_path", Str, "path the JSON index is written to").path(WriteFile),
            ParamSpec::optional("file_pattern", Str, "glob matching Markdown file names")
                .default(ParamDefault::Str("*.md")),
            ParamSpec::optional("tag_pattern", Str, "heading marker: # for ATX headings, === for setext")
                .default(ParamDefault::Str("#")),
        ],
    },
    OperationSpec {
        kind: OperationKind::FetchApiData,
        description: "Call an HTTP API and save the JSON response",
        parameters: &[
            ParamSpec::required("api_url", Str, "URL of the API endpoint"),
            ParamSpec::optional("http_method", Str, "HTTP method, GET when omitted")
                .default(ParamDefault::Str("GET")),
            ParamSpec::optional("output_file_path", Str, "path the response is saved to").path(WriteFile),
            ParamSpec::optional("request_headers", Object, "headers sent with the request"),
            ParamSpec::optional("request_params", Object, "query parameters sent with the request"),
        ],
    },
    OperationSpec {
        kind: OperationKind::ScrapeWebsite,
        description: "Extract text matching CSS selectors from a website and save it as JSON or CSV",
        parameters: &[
            ParamSpec::required("website_url", Str, "URL of the first page to scrape"),
            ParamSpec::required("css_selectors", Array, "CSS selectors whose text is extracted"),
            ParamSpec::required("output_file_path", Str, "path the scraped data is saved to").path(WriteFile),
            ParamSpec::optional("data_format", Str, "json or csv")
                .default(ParamDefault::Str("json")),
            ParamSpec::optional("max_depth", Integer, "link depth to crawl, 1 scrapes only the first page")
                .default(ParamDefault::Int(1)),
        ],
    },
    OperationSpec {
        kind: OperationKind::ExtractEmailSender,
        description: "Read an email message from a file, ask the language model to extract information such as the sender's address, and write the answer",
        parameters: &[
            ParamSpec::optional("input_file_path", Str, "path of the email text")
                .path(ReadFile)
                .default(ParamDefault::Str("/data/email.txt")),
            ParamSpec::optional("output_file_path", Str, "path the extracted text is written to")
                .path(WriteFile)
                .default(ParamDefault::Str("/data/email-sender.txt")),
            ParamSpec::optional("process_instruction", Str, "what to extract from the email")
                .default(ParamDefault::Str("extract the sender's email address")),
        ],
    },
    OperationSpec {
        kind: OperationKind::ExtractCardNumber,
        description: "Read a credit card image, ask the language model for the card number, and write the digits",
        parameters: &[
            ParamSpec::optional("input_image_path", Str, "path of the card image")
                .path(ReadFile)
                .default(ParamDefault::Str("/data/credit-card.png")),
            ParamSpec::optional("output_file_path", Str, "path the card number is written to")
                .path(WriteFile)
                .default(ParamDefault::Str("/data/credit-card.txt")),
            ParamSpec::optional("process_instruction", Str, "what to extract from the image")
                .default(ParamDefault::Str("extract the card number without spaces")),
        ],
    },
];

pub fn catalog() -> &'static [OperationSpec] {
    &CATALOG
}

pub fn find(name: &str) -> Option<&'static OperationSpec> {
    OperationKind::from_name(name.trim()).map(OperationKind::spec)
}

/// Checks the catalog/registry invariants once at startup.
pub fn verify_catalog() -> Result<()> {
    let mut names = BTreeSet::new();
    for (index, spec) in catalog().iter().enumerate() {
        if !names.insert(spec.name()) {
            anyhow::bail!("duplicate operation name `{}` in catalog", spec.name());
        }
        if OperationKind::ALL.get(index) != Some(&spec.kind) {
            anyhow::bail!("catalog entry {index} is out of order for `{}`", spec.name());
        }
        if OperationKind::from_name(spec.name()) != Some(spec.kind) || spec.kind.spec() != spec {
            anyhow::bail!("operation `{}` does not round-trip through the registry", spec.name());
        }
        let mut params = BTreeSet::new();
        for param in spec.parameters {
            if !params.insert(param.name) {
                anyhow::bail!(
                    "operation `{}` declares parameter `{}` twice",
                    spec.name(),
                    param.name
                );
            }
            if param.required && param.default != ParamDefault::None {
                anyhow::bail!(
                    "required parameter `{}.{}` must not declare a default",
                    spec.name(),
                    param.name
                );
            }
        }
    }
    if names.len() != OperationKind::ALL.len() {
        anyhow::bail!(
            "catalog lists {} operations but the registry knows {}",
            names.len(),
            OperationKind::ALL.len()
        );
    }
    Ok(())
}

/// Renders one operation as a chat-completions tool definition.
pub fn function_schema(spec: &OperationSpec) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for param in spec.parameters {
        let mut property = json!({
            "type": param.kind.as_str(),
            "description": param.description,
        });
        if param.kind == Array {
            property["items"] = json!({ "type": "string" });
        }
        if param.default != ParamDefault::None {
            property["default"] = param.default.to_value();
        }
        properties.insert(param.name.to_owned(), property);
        if param.required {
            required.push(param.name);
        }
    }

    json!({
        "type": "function",
        "function": {
            "name": spec.name(),
            "description": spec.description,
            "parameters": {
                "type": "object",
                "properties": Value::Object(properties),
                "required": required,
                "additionalProperties": false,
            }
        }
    })
}

pub fn tool_schemas(specs: &[OperationSpec]) -> Vec<Value> {
    specs.iter().map(function_schema).collect()
}
