//! Raw deserialization of the benchmark-definition XML (spec §6.1).
//! These structs mirror the document shape one-to-one; `expand.rs`
//! turns them into the resolved `model::Benchmark`. Kept separate from
//! `model` so the XML's quirks (legacy `<test>` alias, mixed-content
//! `<option>`) don't leak into the clean data model runs are built
//! from.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct XmlOption {
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "$text")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct XmlRequire {
    #[serde(rename = "@cpuModel")]
    pub cpu_model: Option<String>,
    #[serde(rename = "@cpuCores")]
    pub cpu_cores: Option<u32>,
    #[serde(rename = "@memory")]
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct XmlColumn {
    #[serde(rename = "@title")]
    pub title: Option<String>,
    #[serde(rename = "@numberOfDigits")]
    pub number_of_digits: Option<u8>,
    #[serde(rename = "$text")]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct XmlColumns {
    #[serde(rename = "column", default)]
    pub column: Vec<XmlColumn>,
}

/// A `<sourcefiles>` block: either a benchmark/run-definition-global
/// one, or one nested inside a `<rundefinition>`/`<test>`. Spec §6.1.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XmlSourcefiles {
    #[serde(rename = "@name")]
    pub name: Option<String>,

    #[serde(rename = "include", default)]
    pub include: Vec<String>,
    #[serde(rename = "includesfile", default)]
    pub includesfile: Vec<String>,
    #[serde(rename = "exclude", default)]
    pub exclude: Vec<String>,
    #[serde(rename = "excludesfile", default)]
    pub excludesfile: Vec<String>,
    #[serde(rename = "withoutfile", default)]
    pub withoutfile: Vec<String>,
    #[serde(rename = "append", default)]
    pub append: Vec<String>,

    #[serde(rename = "option", default)]
    pub options: Vec<XmlOption>,
    #[serde(rename = "propertyfile", default)]
    pub property_files: Vec<String>,
    #[serde(rename = "requiredfiles", default)]
    pub required_files: Vec<String>,
}

/// A `<rundefinition>` block, with legacy alias `<test>` (spec §6.1,
/// §4.1 step 4): structurally a sourcefiles-bearing container, with
/// its own options/propertyfiles/requiredfiles plus any number of
/// nested `<sourcefiles>` groups.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct XmlRunDefinition {
    #[serde(rename = "@name")]
    pub name: Option<String>,

    #[serde(rename = "option", default)]
    pub options: Vec<XmlOption>,
    #[serde(rename = "propertyfile", default)]
    pub property_files: Vec<String>,
    #[serde(rename = "requiredfiles", default)]
    pub required_files: Vec<String>,
    #[serde(rename = "sourcefiles", default)]
    pub sourcefiles: Vec<XmlSourcefiles>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename = "benchmark")]
pub struct XmlBenchmark {
    #[serde(rename = "@tool")]
    pub tool: String,
    #[serde(rename = "@name")]
    pub name: Option<String>,
    #[serde(rename = "@memlimit")]
    pub memlimit: Option<String>,
    #[serde(rename = "@timelimit")]
    pub timelimit: Option<String>,
    #[serde(rename = "@hardtimelimit")]
    pub hardtimelimit: Option<String>,
    #[serde(rename = "@cpuCores")]
    pub cpu_cores: Option<u32>,
    #[serde(rename = "@threads")]
    pub threads: Option<u32>,

    #[serde(rename = "requiredfiles", default)]
    pub required_files: Vec<String>,
    #[serde(rename = "resultfiles", default)]
    pub result_files: Vec<String>,
    #[serde(rename = "require", default)]
    pub require: Vec<XmlRequire>,
    #[serde(rename = "option", default)]
    pub options: Vec<XmlOption>,
    #[serde(rename = "propertyfile", default)]
    pub property_files: Vec<String>,
    #[serde(default)]
    pub columns: XmlColumns,
    #[serde(rename = "sourcefiles", default)]
    pub sourcefiles: Vec<XmlSourcefiles>,
    #[serde(rename = "rundefinition", default)]
    pub rundefinitions: Vec<XmlRunDefinition>,
    #[serde(rename = "test", default)]
    pub tests: Vec<XmlRunDefinition>,
}

impl XmlBenchmark {
    pub fn from_str(xml: &str) -> anyhow::Result<Self> {
        quick_xml::de::from_str(xml).map_err(|e| anyhow::anyhow!("parsing benchmark XML: {e}"))
    }

    /// `<rundefinition>` and its legacy alias `<test>`, in document
    /// order as far as serde preserves it (both vectors are appended,
    /// `<test>` blocks trailing any `<rundefinition>` ones -- good
    /// enough since real benchmark files use one alias consistently).
    pub fn all_rundefinitions(&self) -> Vec<&XmlRunDefinition> {
        self.rundefinitions.iter().chain(self.tests.iter()).collect()
    }
}

/// A seconds-or-memory limit value that accepts a plain number or the
/// spec's `-1` "remove this limit" sentinel (spec §8 boundary
/// behavior).
pub fn parse_limit_attr(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_parse_minimal_benchmark() {
        let xml = r#"
            <benchmark tool="generic-exitcode" memlimit="2000" timelimit="100" threads="2">
                <columns>
                    <column title="status">status</column>
                </columns>
                <rundefinition name="main">
                    <sourcefiles name="safe">
                        <include>*.c</include>
                        <propertyfile>prop.prp</propertyfile>
                    </sourcefiles>
                </rundefinition>
            </benchmark>
        "#;
        let b = XmlBenchmark::from_str(xml).unwrap();
        assert_eq!(b.tool, "generic-exitcode");
        assert_eq!(b.threads, Some(2));
        assert_eq!(b.rundefinitions.len(), 1);
        assert_eq!(b.rundefinitions[0].sourcefiles[0].include, vec!["*.c".to_string()]);
        assert_eq!(b.columns.column.len(), 1);
    }

    #[test]
    fn t_legacy_test_alias() {
        let xml = r#"
            <benchmark tool="generic-exitcode">
                <test name="legacy">
                    <sourcefiles>
                        <include>*.c</include>
                    </sourcefiles>
                </test>
            </benchmark>
        "#;
        let b = XmlBenchmark::from_str(xml).unwrap();
        assert_eq!(b.all_rundefinitions().len(), 1);
        assert_eq!(b.all_rundefinitions()[0].name.as_deref(), Some("legacy"));
    }

    #[test]
    fn t_option_name_and_body() {
        let xml = r#"
            <benchmark tool="x">
                <option name="-timeout">10</option>
                <option name="-heap">null</option>
            </benchmark>
        "#;
        let b = XmlBenchmark::from_str(xml).unwrap();
        assert_eq!(b.options[0].name.as_deref(), Some("-timeout"));
        assert_eq!(b.options[0].value.as_deref(), Some("10"));
    }
}
