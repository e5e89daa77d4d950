//! Heuristic form filling.
//!
//! [`plan`] is pure: it reads a scanned form and the profile and returns the
//! writes it would make. [`fill_form`] scans, plans and applies. A plan never
//! contains a write whose effect is already present, so running the mapper
//! twice over an unchanged form writes nothing the second time.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::browser::{Control, DomProvider, ScannedField};
use crate::core::error::{tolerate, EngineError};
use crate::core::types::{InputKind, ProfileKey, TagKind, UserProfile};

// ───────────────────────────────────────────────────────────────────────────
// Rule tables
// ───────────────────────────────────────────────────────────────────────────

/// One text-field category. Matches when the metadata blob contains one of
/// `any`, one of `with` (if non-empty), and none of `without`.
#[derive(Debug, Clone, Copy)]
pub struct TextRule {
    pub key: ProfileKey,
    pub any: &'static [&'static str],
    pub with: &'static [&'static str],
    pub without: &'static [&'static str],
}

impl TextRule {
    pub fn matches(&self, blob: &str) -> bool {
        let has = |words: &[&str]| words.iter().any(|w| blob.contains(w));
        has(self.any) && (self.with.is_empty() || has(self.with)) && !has(self.without)
    }
}

/// Ordered: the first matching rule decides.
pub const TEXT_RULES: &[TextRule] = &[
    TextRule {
        key: ProfileKey::ChildName,
        any: &["자녀", "아동", "아이"],
        with: &["이름", "성명", "name"],
        without: &[],
    },
    TextRule {
        key: ProfileKey::Name,
        any: &["보호자", "신청자", "이름", "성명"],
        with: &[],
        without: &["자녀"],
    },
    TextRule {
        key: ProfileKey::ChildAge,
        any: &["나이", "개월", "연령", "age"],
        with: &[],
        without: &[],
    },
    TextRule {
        key: ProfileKey::Phone,
        any: &["휴대", "연락처", "전화", "핸드폰", "tel", "phone"],
        with: &[],
        without: &[],
    },
    TextRule {
        key: ProfileKey::Email,
        any: &["email", "이메일"],
        with: &[],
        without: &[],
    },
    TextRule {
        key: ProfileKey::Address,
        any: &["주소", "address"],
        with: &[],
        without: &[],
    },
];

pub const CONSENT_KEYWORDS: &[&str] = &["agree", "동의", "약관", "개인정보", "chkall", "checkall", "all"];
pub const MASTER_TOGGLE_KEYWORDS: &[&str] = &["chkall", "checkall", "전체"];
pub const AGREEMENT_GROUP_KEYWORDS: &[&str] = &["agree", "동의", "약관", "개인정보"];
pub const GENDER_GROUP_KEYWORDS: &[&str] = &["성별", "gender", "sex"];
pub const REQUIRED_GROUP_KEYWORDS: &[&str] = &["필수", "required"];

/// Birth sub-field keywords. Checked day, month, year: the first hit wins.
/// Matched against the name's tokens, see [`birth_part`].
pub const BIRTH_YEAR_KEYWORDS: &[&str] = &["birth", "생년", "년", "year", "yyyy", "yy"];
pub const BIRTH_MONTH_KEYWORDS: &[&str] = &["월", "month", "mm"];
pub const BIRTH_DAY_KEYWORDS: &[&str] = &["일", "day", "dd"];

pub const FALLBACK_EMAIL: &str = "test@example.com";
pub const FALLBACK_PHONE: &str = "01012345678";
pub const FALLBACK_TEXT: &str = "자동입력";

pub fn text_category(blob: &str) -> Option<ProfileKey> {
    TEXT_RULES.iter().find(|r| r.matches(blob)).map(|r| r.key)
}

fn contains_any(blob: &str, words: &[&str]) -> bool {
    words.iter().any(|w| blob.contains(w))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
}

/// Female is checked first: "female" contains "male".
pub fn classify_gender(raw: &str) -> Option<Gender> {
    let t = raw.trim().to_lowercase();
    if t.is_empty() {
        return None;
    }
    if matches!(t.as_str(), "여" | "f" | "w") || contains_any(&t, &["여자", "여아", "female", "woman", "girl"]) {
        return Some(Gender::Female);
    }
    if matches!(t.as_str(), "남" | "m") || contains_any(&t, &["남자", "남아", "male", "man", "boy"]) {
        return Some(Gender::Male);
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BirthDate {
    pub year: String,
    pub month: String,
    pub day: String,
}

impl BirthDate {
    pub fn iso(&self) -> String {
        format!("{}-{}-{}", self.year, self.month, self.day)
    }
}

/// `YYYY-MM-DD`, `YYYY/MM/DD` or `YYYYMMDD`.
pub fn parse_birth(raw: &str) -> Option<BirthDate> {
    let s = raw.trim().replace('/', "-");
    let (y, m, d) = match s.len() {
        8 if s.chars().all(|c| c.is_ascii_digit()) => {
            (s[..4].to_string(), s[4..6].to_string(), s[6..8].to_string())
        }
        10 => {
            let parts: Vec<&str> = s.split('-').collect();
            if parts.len() != 3 {
                return None;
            }
            (parts[0].to_string(), parts[1].to_string(), parts[2].to_string())
        }
        _ => return None,
    };
    let all_digits = |p: &str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    if y.len() != 4 || !all_digits(&y) || !all_digits(&m) || !all_digits(&d) {
        return None;
    }
    Some(BirthDate {
        year: y,
        month: m,
        day: d,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BirthPart {
    Year,
    Month,
    Day,
}

/// A keyword hits a token it equals. Keywords of two or more characters also
/// hit a token they start or end (`birthday`, `mmdd`); single-character ones
/// never do, so `이메일` is not a day field.
fn token_hit(tokens: &[&str], words: &[&str]) -> bool {
    tokens.iter().any(|t| {
        words.iter().any(|w| {
            *t == *w || (w.chars().count() > 1 && (t.starts_with(w) || t.ends_with(w)))
        })
    })
}

pub fn birth_part(key: &str) -> Option<BirthPart> {
    let key = key.to_lowercase();
    let tokens: Vec<&str> = key
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if token_hit(&tokens, BIRTH_DAY_KEYWORDS) {
        Some(BirthPart::Day)
    } else if token_hit(&tokens, BIRTH_MONTH_KEYWORDS) {
        Some(BirthPart::Month)
    } else if token_hit(&tokens, BIRTH_YEAR_KEYWORDS) {
        Some(BirthPart::Year)
    } else {
        None
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Plan
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    SetText(String),
    /// Click a checkbox or radio.
    Toggle,
    Select(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    MasterToggle,
    Consent,
    Agreement,
    Gender,
    RequiredRadio,
    SelectByChildName,
    SelectFirstValue,
    Profile(&'static str),
    BirthPart,
    RequiredFallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    /// Index into the scanned field list.
    pub field: usize,
    pub op: WriteOp,
    pub reason: Reason,
}

/// A field left untouched because nothing could be said about it with
/// confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingGap {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillPlan {
    pub writes: Vec<PlannedWrite>,
    pub gaps: Vec<MappingGap>,
}

impl FillPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    fn push(&mut self, field: usize, op: WriteOp, reason: Reason) {
        self.writes.push(PlannedWrite { field, op, reason });
    }

    fn gap(&mut self, f: &ScannedField, reason: impl Into<String>) {
        self.gaps.push(MappingGap {
            field: field_key(f),
            reason: reason.into(),
        });
    }
}

fn field_key(f: &ScannedField) -> String {
    let d = &f.descriptor;
    if !d.name.is_empty() {
        d.name.clone()
    } else if !d.id.is_empty() {
        d.id.clone()
    } else {
        format!("<{}>", f.control.tag)
    }
}

fn is_master(f: &ScannedField) -> bool {
    f.descriptor.input_kind == InputKind::Checkbox
        && contains_any(&f.descriptor.metadata_blob(), MASTER_TOGGLE_KEYWORDS)
}

fn required_fallback(kind: &InputKind, profile: &UserProfile) -> String {
    match kind {
        InputKind::Email => profile
            .get(ProfileKey::Email)
            .unwrap_or(FALLBACK_EMAIL)
            .to_string(),
        InputKind::Tel | InputKind::Number => {
            let digits: String = profile
                .get(ProfileKey::Phone)
                .unwrap_or("")
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if digits.is_empty() {
                FALLBACK_PHONE.to_string()
            } else {
                digits
            }
        }
        _ => profile
            .get(ProfileKey::Name)
            .or_else(|| profile.get(ProfileKey::ChildName))
            .unwrap_or(FALLBACK_TEXT)
            .to_string(),
    }
}

fn plan_select(i: usize, f: &ScannedField, profile: &UserProfile, out: &mut FillPlan) {
    let opts = &f.state.options;
    let by_child = profile
        .get(ProfileKey::ChildName)
        .and_then(|name| opts.iter().find(|o| o.text.contains(name)))
        .map(|o| (o.value.clone(), Reason::SelectByChildName));
    let chosen = by_child.or_else(|| {
        opts.iter()
            .find(|o| !o.value.trim().is_empty())
            .map(|o| (o.value.clone(), Reason::SelectFirstValue))
    });
    match chosen {
        Some((value, reason)) if value != f.state.value => {
            out.push(i, WriteOp::Select(value), reason)
        }
        Some(_) => {}
        None => out.gap(f, "select has no option with a value"),
    }
}

fn plan_text(
    i: usize,
    f: &ScannedField,
    profile: &UserProfile,
    birth: Option<&BirthDate>,
    out: &mut FillPlan,
) {
    let d = &f.descriptor;
    let blob = d.metadata_blob();
    let mut value: Option<(String, Reason)> = None;
    let mut missing: Option<ProfileKey> = None;
    let category = if d.is_text_like() { text_category(&blob) } else { None };

    if let Some(key) = category {
        match profile.get(key) {
            Some(v) => value = Some((v.to_string(), Reason::Profile(key.as_str()))),
            None => missing = Some(key),
        }
    }

    // A field that already belongs to a profile category keeps that value.
    let birth_field = matches!(category, None | Some(ProfileKey::ChildBirth));
    if let (Some(b), true) = (birth, birth_field) {
        if d.tag == TagKind::Input {
            if d.input_kind == InputKind::Date {
                value = Some((b.iso(), Reason::BirthPart));
            } else {
                let key = if d.name.is_empty() { &d.id } else { &d.name };
                if let Some(part) = birth_part(key) {
                    let v = match part {
                        BirthPart::Year => &b.year,
                        BirthPart::Month => &b.month,
                        BirthPart::Day => &b.day,
                    };
                    value = Some((v.clone(), Reason::BirthPart));
                }
            }
        }
    }

    if value.is_none() && f.state.value.trim().is_empty() && d.looks_required() {
        value = Some((required_fallback(&d.input_kind, profile), Reason::RequiredFallback));
    }

    match value {
        Some((v, reason)) => {
            if v != f.state.value {
                out.push(i, WriteOp::SetText(v), reason);
            }
        }
        None if f.state.value.trim().is_empty() => match missing {
            Some(key) => out.gap(f, format!("profile has no {}", key.as_str())),
            None => out.gap(f, "no category matched"),
        },
        None => {}
    }
}

struct RadioGroup {
    members: Vec<usize>,
    blob: String,
}

fn radio_groups(fields: &[ScannedField]) -> Vec<RadioGroup> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, RadioGroup> = BTreeMap::new();
    for (i, f) in fields.iter().enumerate() {
        if f.descriptor.input_kind != InputKind::Radio || !f.state.editable() {
            continue;
        }
        let key = if f.descriptor.name.is_empty() {
            format!("#{i}")
        } else {
            f.descriptor.name.clone()
        };
        let g = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            RadioGroup {
                members: Vec::new(),
                blob: String::new(),
            }
        });
        g.members.push(i);
        g.blob.push(' ');
        g.blob.push_str(&f.descriptor.metadata_blob());
    }
    order
        .into_iter()
        .filter_map(|k| groups.remove(&k))
        .collect()
}

fn option_gender(f: &ScannedField) -> Option<Gender> {
    classify_gender(&f.state.value).or_else(|| classify_gender(&f.descriptor.label))
}

fn plan_radio_group(g: &RadioGroup, fields: &[ScannedField], profile: &UserProfile, out: &mut FillPlan) {
    let checked = g.members.iter().copied().find(|&i| fields[i].state.checked);
    let pick = |i: usize, reason: Reason, out: &mut FillPlan| {
        if checked != Some(i) {
            out.push(i, WriteOp::Toggle, reason);
        }
    };

    if contains_any(&g.blob, AGREEMENT_GROUP_KEYWORDS) {
        let yes = g
            .members
            .iter()
            .copied()
            .find(|&i| fields[i].state.value.trim().eq_ignore_ascii_case("y"))
            .or_else(|| {
                g.members.iter().copied().find(|&i| {
                    let l = fields[i].descriptor.label.to_lowercase();
                    (l.contains("동의") && !l.contains('안') && !l.contains('않'))
                        || (l.contains("agree") && !l.contains("disagree"))
                })
            });
        match yes {
            Some(i) => pick(i, Reason::Agreement, out),
            None if checked.is_none() => out.gap(&fields[g.members[0]], "agreement group without a yes option"),
            None => {}
        }
        return;
    }

    let genders: Vec<(usize, Gender)> = g
        .members
        .iter()
        .filter_map(|&i| option_gender(&fields[i]).map(|gd| (i, gd)))
        .collect();
    let gender_like = contains_any(&g.blob, GENDER_GROUP_KEYWORDS)
        || (genders.iter().any(|(_, gd)| *gd == Gender::Male)
            && genders.iter().any(|(_, gd)| *gd == Gender::Female));
    if gender_like {
        if let Some(want) = profile.get(ProfileKey::ChildGender).and_then(classify_gender) {
            if let Some(&(i, _)) = genders.iter().find(|(_, gd)| *gd == want) {
                pick(i, Reason::Gender, out);
                return;
            }
        }
    }

    if checked.is_none() {
        let required = g
            .members
            .iter()
            .any(|&i| fields[i].descriptor.looks_required())
            || contains_any(&g.blob, REQUIRED_GROUP_KEYWORDS);
        if required || gender_like {
            out.push(g.members[0], WriteOp::Toggle, Reason::RequiredRadio);
        } else {
            out.gap(&fields[g.members[0]], "optional radio group left unselected");
        }
    }
}

/// Decide every write for one scanned form. Master toggles come first.
pub fn plan(fields: &[ScannedField], profile: &UserProfile) -> FillPlan {
    let mut out = FillPlan::default();
    let birth = profile.get(ProfileKey::ChildBirth).and_then(parse_birth);

    for (i, f) in fields.iter().enumerate() {
        if is_master(f) && f.state.editable() && !f.state.checked {
            out.push(i, WriteOp::Toggle, Reason::MasterToggle);
        }
    }

    for (i, f) in fields.iter().enumerate() {
        let d = &f.descriptor;
        if !f.state.editable() {
            continue;
        }
        match (d.tag, &d.input_kind) {
            (TagKind::Input, InputKind::Hidden | InputKind::Button | InputKind::Submit) => {}
            (TagKind::Input, InputKind::Radio) => {}
            (TagKind::Input, InputKind::Checkbox) => {
                if !is_master(f)
                    && !f.state.checked
                    && contains_any(&d.metadata_blob(), CONSENT_KEYWORDS)
                {
                    out.push(i, WriteOp::Toggle, Reason::Consent);
                }
            }
            (TagKind::Select, _) => plan_select(i, f, profile, &mut out),
            (TagKind::Textarea, _)
            | (
                TagKind::Input,
                InputKind::Unspecified
                | InputKind::Text
                | InputKind::Tel
                | InputKind::Email
                | InputKind::Number
                | InputKind::Date,
            ) => plan_text(i, f, profile, birth.as_ref(), &mut out),
            (TagKind::Input, InputKind::Other(_)) => {}
        }
    }

    for g in radio_groups(fields) {
        plan_radio_group(&g, fields, profile, &mut out);
    }
    out
}

// ───────────────────────────────────────────────────────────────────────────
// Apply
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FillReport {
    pub fields: usize,
    pub writes: usize,
    pub gaps: Vec<MappingGap>,
}

/// Apply `plan` to `fields`. Per-field faults are tolerated; a disconnect is
/// not.
pub async fn apply_plan<D: DomProvider + ?Sized>(
    dom: &mut D,
    fields: &[ScannedField],
    plan: &FillPlan,
) -> Result<usize, EngineError> {
    let mut done = 0;
    for w in &plan.writes {
        let Some(f) = fields.get(w.field) else {
            continue;
        };
        let c: &Control = &f.control;
        let res = match &w.op {
            WriteOp::SetText(v) => dom.set_value(c, v).await,
            WriteOp::Select(v) => dom.select_option(c, v).await,
            WriteOp::Toggle => {
                tolerate("scroll_into_view", dom.scroll_into_view(c).await)?;
                dom.invoke(c).await
            }
        };
        if tolerate("field write", res)?.is_some() {
            debug!("field_mapper: {} <- {:?} ({:?})", field_key(f), w.op, w.reason);
            done += 1;
        }
    }
    Ok(done)
}

/// Scan, plan and fill one form. Master toggles are applied first and the
/// form is re-scanned, since a master usually flips the boxes it governs.
pub async fn fill_form<D: DomProvider + ?Sized>(
    dom: &mut D,
    form: &Control,
    profile: &UserProfile,
) -> Result<FillReport, EngineError> {
    let Some(mut fields) = tolerate("form_fields", dom.form_fields(form).await)? else {
        return Ok(FillReport::default());
    };
    let mut planned = plan(&fields, profile);
    let mut writes = 0;

    let masters = FillPlan {
        writes: planned
            .writes
            .iter()
            .filter(|w| w.reason == Reason::MasterToggle)
            .cloned()
            .collect(),
        gaps: Vec::new(),
    };
    if !masters.is_empty() {
        writes += apply_plan(dom, &fields, &masters).await?;
        if let Some(rescanned) = tolerate("form_fields", dom.form_fields(form).await)? {
            fields = rescanned;
            planned = plan(&fields, profile);
        } else {
            planned.writes.retain(|w| w.reason != Reason::MasterToggle);
        }
    }

    writes += apply_plan(dom, &fields, &planned).await?;
    for g in &planned.gaps {
        debug!("field_mapper: gap {}: {}", g.field, g.reason);
    }
    info!(
        "field_mapper: {} field(s), {} write(s), {} gap(s)",
        fields.len(),
        writes,
        planned.gaps.len()
    );
    Ok(FillReport {
        fields: fields.len(),
        writes,
        gaps: planned.gaps,
    })
}
