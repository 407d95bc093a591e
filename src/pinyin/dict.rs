//! Curated single-character pinyin dictionary.
//!
//! First-reading, tone-stripped syllables for common filename vocabulary.
//! Not exhaustive — characters outside this set are simply skipped during
//! pinyin expansion, which still leaves them searchable as ordinary CJK
//! tokens via the path tokenizer.

use std::collections::HashMap;

use once_cell::sync::Lazy;

pub static DICT: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    [
        ('报', "bao"),
        ('告', "gao"),
        ('文', "wen"),
        ('件', "jian"),
        ('档', "dang"),
        ('图', "tu"),
        ('片', "pian"),
        ('音', "yin"),
        ('乐', "yue"),
        ('视', "shi"),
        ('频', "pin"),
        ('下', "xia"),
        ('载', "zai"),
        ('桌', "zhuo"),
        ('面', "mian"),
        ('照', "zhao"),
        ('备', "bei"),
        ('份', "fen"),
        ('项', "xiang"),
        ('目', "mu"),
        ('会', "hui"),
        ('议', "yi"),
        ('合', "he"),
        ('同', "tong"),
        ('发', "fa"),
        ('票', "piao"),
        ('简', "jian"),
        ('历', "li"),
        ('新', "xin"),
        ('旧', "jiu"),
        ('版', "ban"),
        ('本', "ben"),
        ('数', "shu"),
        ('据', "ju"),
        ('表', "biao"),
        ('格', "ge"),
        ('说', "shuo"),
        ('明', "ming"),
    ]
    .into_iter()
    .collect()
});
