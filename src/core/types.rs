use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine state. Exactly one value is active; transitions only move forward,
/// except `WaitingFine`, which loops on itself until it finds the action or the
/// window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PollState {
    Init,
    WaitingCoarse,
    WaitingFine,
    ActionFound,
    FormDetected,
    Submitted,
    Verified,
    Failed,
    TimedOut,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PollState::Verified | PollState::Failed | PollState::TimedOut
        )
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Form model
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Input,
    Select,
    Textarea,
}

impl TagKind {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "input" => Some(TagKind::Input),
            "select" => Some(TagKind::Select),
            "textarea" => Some(TagKind::Textarea),
            _ => None,
        }
    }
}

/// The `type` attribute of an input, folded into the handful of kinds the
/// mapper distinguishes. Anything unrecognised is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Unspecified,
    Text,
    Tel,
    Email,
    Number,
    Date,
    Hidden,
    Checkbox,
    Radio,
    Button,
    Submit,
    Other(String),
}

impl InputKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" => InputKind::Unspecified,
            "text" => InputKind::Text,
            "tel" => InputKind::Tel,
            "email" => InputKind::Email,
            "number" => InputKind::Number,
            "date" => InputKind::Date,
            "hidden" => InputKind::Hidden,
            "checkbox" => InputKind::Checkbox,
            "radio" => InputKind::Radio,
            "button" => InputKind::Button,
            "submit" => InputKind::Submit,
            other => InputKind::Other(other.to_string()),
        }
    }
}

/// Read-only metadata of one discovered form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub tag: TagKind,
    pub input_kind: InputKind,
    pub name: String,
    pub id: String,
    pub placeholder: String,
    pub label: String,
    pub required: bool,
}

impl FieldDescriptor {
    /// name + id + placeholder + label, case-folded. Every keyword rule runs
    /// against this blob.
    pub fn metadata_blob(&self) -> String {
        [
            self.name.as_str(),
            self.id.as_str(),
            self.placeholder.as_str(),
            self.label.as_str(),
        ]
        .join(" ")
        .to_lowercase()
    }

    pub fn is_text_like(&self) -> bool {
        match self.tag {
            TagKind::Textarea => true,
            TagKind::Select => false,
            TagKind::Input => matches!(
                self.input_kind,
                InputKind::Unspecified | InputKind::Text | InputKind::Tel | InputKind::Email
            ),
        }
    }

    /// Explicit `required` attribute, an asterisk, or a "required" keyword in
    /// the label.
    pub fn looks_required(&self) -> bool {
        if self.required {
            return true;
        }
        let label = self.label.to_lowercase();
        label.contains('*') || label.contains("필수") || label.contains("required")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
    #[serde(default)]
    pub selected: bool,
}

/// Live state of a field at scan time. Produced fresh on every scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldState {
    pub value: String,
    pub checked: bool,
    pub readonly: bool,
    pub disabled: bool,
    pub options: Vec<SelectOption>,
}

impl FieldState {
    pub fn editable(&self) -> bool {
        !self.readonly && !self.disabled
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Profile
// ───────────────────────────────────────────────────────────────────────────

/// Semantic keys the field mapper knows how to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfileKey {
    Name,
    ChildName,
    ChildAge,
    Phone,
    Email,
    Address,
    ChildBirth,
    ChildGender,
}

impl ProfileKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ProfileKey::Name => "name",
            ProfileKey::ChildName => "child_name",
            ProfileKey::ChildAge => "child_age",
            ProfileKey::Phone => "phone",
            ProfileKey::Email => "email",
            ProfileKey::Address => "address",
            ProfileKey::ChildBirth => "child_birth",
            ProfileKey::ChildGender => "child_gender",
        }
    }
}

/// Semantic key → value. Loaded once, never mutated. Unknown keys are kept so
/// a profile file can carry extra data without failing to load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfile(BTreeMap<String, String>);

impl UserProfile {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Trimmed, non-empty value for `key`.
    pub fn get(&self, key: ProfileKey) -> Option<&str> {
        self.0
            .get(key.as_str())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.trim().is_empty())
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Run result
// ───────────────────────────────────────────────────────────────────────────

/// How the engine reached the submission step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionPath {
    /// The apply control was detected and invoked.
    Control,
    /// A direct apply URL exposed the form.
    DirectUrl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub final_state: PollState,
    pub reason: Option<String>,
    pub path: Option<AcquisitionPath>,
    pub submitted: bool,
    /// `None` when verification never ran, otherwise whether corroborating
    /// evidence was found.
    pub verified: Option<bool>,
    pub result_message: Option<String>,
}

impl RunOutcome {
    pub fn terminal(state: PollState, reason: impl Into<String>) -> Self {
        Self {
            final_state: state,
            reason: Some(reason.into()),
            path: None,
            submitted: false,
            verified: None,
            result_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(label: &str, required: bool) -> FieldDescriptor {
        FieldDescriptor {
            tag: TagKind::Input,
            input_kind: InputKind::Text,
            name: "Child_Name".into(),
            id: "cname".into(),
            placeholder: "".into(),
            label: label.into(),
            required,
        }
    }

    #[test]
    fn metadata_blob_is_case_folded() {
        let d = descriptor("자녀 이름", false);
        assert_eq!(d.metadata_blob(), "child_name cname  자녀 이름");
    }

    #[test]
    fn required_detection_covers_attribute_asterisk_and_keyword() {
        assert!(descriptor("이름", true).looks_required());
        assert!(descriptor("이름 *", false).looks_required());
        assert!(descriptor("연락처(필수)", false).looks_required());
        assert!(!descriptor("비고", false).looks_required());
    }

    #[test]
    fn input_kind_parsing_keeps_unknown_types() {
        assert_eq!(InputKind::parse(""), InputKind::Unspecified);
        assert_eq!(InputKind::parse("TEL"), InputKind::Tel);
        assert_eq!(InputKind::parse("color"), InputKind::Other("color".into()));
    }

    #[test]
    fn profile_ignores_blank_values() {
        let p = UserProfile::from_pairs([("name", "조상우"), ("email", "  ")]);
        assert_eq!(p.get(ProfileKey::Name), Some("조상우"));
        assert_eq!(p.get(ProfileKey::Email), None);
        assert!(!p.is_empty());
    }

    #[test]
    fn poll_state_serializes_like_the_state_table() {
        let s = serde_json::to_string(&PollState::WaitingFine).unwrap();
        assert_eq!(s, "\"WAITING_FINE\"");
        assert!(PollState::TimedOut.is_terminal());
        assert!(!PollState::Submitted.is_terminal());
    }
}
