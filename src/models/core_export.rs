use serde::{Deserialize, Serialize};

/// Department row of the plain core-data export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub manager_id: Option<String>,
    #[serde(default = "default_level")]
    pub level: i64,
}

/// User row of the plain core-data export
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreUser {
    pub id: String,
    pub username: String,
    pub name: String,
    pub password: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_level() -> i64 {
    1
}

fn default_role() -> String {
    "user".to_string()
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_defaults() {
        let user: CoreUser = serde_json::from_str(
            r#"{"id":"u1","username":"admin","name":"Admin","password":"$2b$hash"}"#,
        )
        .unwrap();
        assert_eq!(user.role, "user");
        assert!(user.is_active);
        assert!(user.department_id.is_none());

        let dept: Department = serde_json::from_str(r#"{"id":"d1","name":"HSE"}"#).unwrap();
        assert_eq!(dept.level, 1);
    }
}
