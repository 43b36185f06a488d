//! Payloads of the `Target` domain lifecycle notifications.

use serde::{Deserialize, Serialize};

/// Metadata the backend reports for a debuggable endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetParams {
    pub session_id: String,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetParams {
    pub session_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCreatedParams {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyedParams {
    pub target_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfoChangedParams {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAutoAttachParams {
    pub auto_attach: bool,
    pub wait_for_debugger_on_start: bool,
    pub flatten: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetParams {
    pub target_id: String,
    pub flatten: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTargetInfoResponse {
    pub target_info: TargetInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_to_target_params_round_trip() {
        let raw = r#"{
            "sessionId": "s1",
            "targetInfo": {
                "targetId": "t1",
                "type": "iframe",
                "title": "Ads",
                "url": "https://ads.example/frame.html",
                "attached": true
            },
            "waitingForDebugger": true
        }"#;
        let params: AttachedToTargetParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.session_id, "s1");
        assert_eq!(params.target_info.kind, "iframe");
        assert!(params.waiting_for_debugger);
    }

    #[test]
    fn waiting_for_debugger_defaults_to_false() {
        let raw = r#"{
            "sessionId": "s2",
            "targetInfo": {"targetId": "t2", "type": "worker"}
        }"#;
        let params: AttachedToTargetParams = serde_json::from_str(raw).unwrap();
        assert!(!params.waiting_for_debugger);
        assert_eq!(params.target_info.title, "");
    }

    #[test]
    fn set_auto_attach_uses_camel_case() {
        let raw = serde_json::to_string(&SetAutoAttachParams {
            auto_attach: true,
            wait_for_debugger_on_start: false,
            flatten: true,
        })
        .unwrap();
        assert!(raw.contains("\"autoAttach\":true"));
        assert!(raw.contains("\"waitForDebuggerOnStart\":false"));
        assert!(raw.contains("\"flatten\":true"));
    }
}
