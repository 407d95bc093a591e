//! Pinyin expansion for CJK filename runs.

mod dict;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF | 0x3040..=0x30FF)
}

/// The pinyin forms derived from one maximal run of CJK characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinyinForms {
    /// Tone-stripped first-reading syllable per character, e.g. `["bao", "gao"]`.
    pub syllables: Vec<String>,
    /// First letter of each syllable, e.g. `"bg"`.
    pub acronym: String,
    /// Syllables concatenated with no separator, e.g. `"baogao"`.
    pub concatenated: String,
}

/// Finds maximal runs of consecutive CJK characters in `text`.
fn cjk_runs(text: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if is_cjk(ch) {
            current.push(ch);
        } else if !current.is_empty() {
            runs.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        runs.push(current);
    }
    runs
}

/// Expands one CJK run into its pinyin forms. Characters missing from the
/// dictionary are skipped; a run with no known characters yields `None`.
pub fn expand_run(run: &str) -> Option<PinyinForms> {
    let syllables: Vec<String> = run.chars().filter_map(|c| dict::DICT.get(&c).map(|s| s.to_string())).collect();
    if syllables.is_empty() {
        return None;
    }
    let acronym: String = syllables.iter().filter_map(|s| s.chars().next()).collect();
    let concatenated = syllables.concat();
    Some(PinyinForms { syllables, acronym, concatenated })
}

/// Expands every CJK run in `text`.
pub fn expand(text: &str) -> Vec<PinyinForms> {
    cjk_runs(text).iter().filter_map(|run| expand_run(run)).collect()
}

/// The whole-string acronym: every CJK character becomes its pinyin
/// acronym letter, every other character (ASCII, punctuation) is kept
/// verbatim in place, e.g. `"报告.doc"` -> `"bg.doc"`.
pub fn whole_string_mixed_acronym(text: &str) -> String {
    text.chars()
        .map(|c| match dict::DICT.get(&c) {
            Some(syllable) => syllable.chars().next().unwrap_or(c).to_string(),
            None if is_cjk(c) => String::new(),
            None => c.to_string(),
        })
        .collect()
}

/// Flattens every form across every run into index terms, space-joined so
/// they can be fed straight through the path tokenizer.
pub fn index_terms(text: &str) -> String {
    let mut terms = Vec::new();
    for forms in expand(text) {
        terms.extend(forms.syllables);
        terms.push(forms.acronym);
        terms.push(forms.concatenated);
    }
    if !terms.is_empty() {
        terms.push(whole_string_mixed_acronym(text));
    }
    terms.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_doc_expands_to_documented_forms() {
        let forms = expand_run("报告").unwrap();
        assert_eq!(forms.syllables, vec!["bao", "gao"]);
        assert_eq!(forms.acronym, "bg");
        assert_eq!(forms.concatenated, "baogao");
    }

    #[test]
    fn unknown_characters_are_skipped_not_fatal() {
        let forms = expand_run("报曌告").unwrap();
        assert_eq!(forms.syllables, vec!["bao", "gao"]);
    }

    #[test]
    fn pure_unknown_run_yields_nothing() {
        assert!(expand_run("曌曌").is_none());
    }

    #[test]
    fn index_terms_includes_all_three_forms() {
        let terms = index_terms("报告.doc");
        assert!(terms.contains("bao"));
        assert!(terms.contains("gao"));
        assert!(terms.contains("bg"));
        assert!(terms.contains("baogao"));
    }

    #[test]
    fn whole_string_acronym_keeps_ascii_in_place() {
        assert_eq!(whole_string_mixed_acronym("报告.doc"), "bg.doc");
    }

    #[test]
    fn index_terms_includes_the_whole_string_acronym() {
        let terms = index_terms("报告.doc");
        assert!(terms.contains("bg.doc"));
    }

    #[test]
    fn whole_string_acronym_is_absent_when_no_cjk_present() {
        assert_eq!(index_terms("report.doc"), "");
    }
}
