use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

use crate::directory::{self, Role, Sender, StaffType};

/// Declarative recipient filter attached to a communication. Unset scalars
/// and empty lists both mean "not filtered on this dimension"; validation
/// decides which dimensions are mandatory for a given sender.
#[derive(Debug, Clone, Default)]
pub struct TargetSpec {
    pub branch: Option<String>,
    pub role: Option<Role>,
    pub staff_type: Option<StaffType>,
    pub teaching_positions: Vec<String>,
    pub non_teaching_positions: Vec<String>,
    pub student_class: Option<String>,
    pub class_arm: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn opt_string(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|x| x.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn string_list(v: &serde_json::Value, key: &str) -> Vec<String> {
    v.get(key)
        .and_then(|x| x.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|e| e.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

impl TargetSpec {
    /// Parses the raw filter object once into a typed spec. Unknown role or
    /// staff-type strings are field errors, not silent drops.
    pub fn from_params(v: &serde_json::Value) -> Result<TargetSpec, Vec<FieldError>> {
        let mut errors = Vec::new();

        let role = match opt_string(v, "role") {
            Some(raw) => match Role::parse(&raw) {
                Some(r) => Some(r),
                None => {
                    errors.push(FieldError::new(
                        "role",
                        "invalid_choice",
                        format!("unknown role: {}", raw),
                    ));
                    None
                }
            },
            None => None,
        };
        let staff_type = match opt_string(v, "staffType") {
            Some(raw) => match StaffType::parse(&raw) {
                Some(t) => Some(t),
                None => {
                    errors.push(FieldError::new(
                        "staffType",
                        "invalid_choice",
                        format!("unknown staff type: {}", raw),
                    ));
                    None
                }
            },
            None => None,
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(TargetSpec {
            branch: opt_string(v, "branch"),
            role,
            staff_type,
            teaching_positions: string_list(v, "teachingPositions"),
            non_teaching_positions: string_list(v, "nonTeachingPositions"),
            student_class: opt_string(v, "studentClass"),
            class_arm: opt_string(v, "classArm"),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "branch": self.branch,
            "role": self.role.map(|r| r.as_str()),
            "staffType": self.staff_type.map(|t| t.as_str()),
            "teachingPositions": self.teaching_positions,
            "nonTeachingPositions": self.non_teaching_positions,
            "studentClass": self.student_class,
            "classArm": self.class_arm,
        })
    }

    pub fn has_staff_filter(&self) -> bool {
        self.staff_type.is_some()
            || !self.teaching_positions.is_empty()
            || !self.non_teaching_positions.is_empty()
    }
}

/// Validates a spec against the sender and returns the normalized spec the
/// resolver consumes. Normalization is part of the contract: with no role
/// selected every dependent filter is cleared (idle state), and student or
/// parent senders get their own branch regardless of what was supplied.
pub fn validate(
    conn: &Connection,
    sender: &Sender,
    spec: &TargetSpec,
) -> Result<TargetSpec, Vec<FieldError>> {
    let mut out = spec.clone();
    let mut errors = Vec::new();

    // Idle state: no role means no recipients; dependent filters are cleared
    // rather than rejected.
    let Some(role) = out.role else {
        out.staff_type = None;
        out.teaching_positions.clear();
        out.non_teaching_positions.clear();
        out.student_class = None;
        out.class_arm = None;
        return Ok(out);
    };

    // Students and parents never pick a branch; theirs is forced.
    match sender.role {
        Role::Student | Role::Parent => {
            out.branch = sender.branch_id.clone();
        }
        _ => {
            if out.branch.is_none() {
                errors.push(FieldError::new("branch", "required", "branch is required"));
            }
        }
    }

    if sender.role == Role::Student && role == Role::Student {
        if out.student_class.is_none() {
            errors.push(FieldError::new(
                "studentClass",
                "required",
                "class is required when a student targets students",
            ));
        }
        if out.class_arm.is_none() {
            errors.push(FieldError::new(
                "classArm",
                "required",
                "class arm is required when a student targets students",
            ));
        }
    }

    if sender.role == Role::Parent {
        match role {
            Role::Student | Role::BranchAdmin => {}
            Role::Staff => {
                // Parents only reach class teachers: teaching positions
                // flagged is_class_teacher, nothing else.
                if !out.non_teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "nonTeachingPositions",
                        "not_permitted",
                        "parents may not target non-teaching staff",
                    ));
                }
                match out.staff_type {
                    None => {
                        if !out.teaching_positions.is_empty() {
                            out.staff_type = Some(StaffType::Teaching);
                        }
                    }
                    Some(StaffType::Teaching) => {}
                    Some(_) => {
                        errors.push(FieldError::new(
                            "staffType",
                            "not_permitted",
                            "parents may only target teaching staff",
                        ));
                    }
                }
                match directory::non_class_teacher_positions(conn, &out.teaching_positions) {
                    Ok(bad) if !bad.is_empty() => {
                        errors.push(FieldError::new(
                            "teachingPositions",
                            "not_permitted",
                            "parents may only target class-teacher positions",
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        errors.push(FieldError::new(
                            "teachingPositions",
                            "lookup_failed",
                            e.to_string(),
                        ));
                    }
                }
            }
            _ => {
                errors.push(FieldError::new(
                    "role",
                    "not_permitted",
                    format!("parents may not target role {}", role.as_str()),
                ));
            }
        }
    }

    // Staff-filter consistency, for staff-like recipient roles with any
    // staff filter supplied. No filter at all is legal and means "all staff
    // of that role" for staff-like senders.
    if role.is_staff_like() && out.has_staff_filter() {
        match out.staff_type {
            None => {
                errors.push(FieldError::new(
                    "staffType",
                    "required",
                    "staff type is required when positions are selected",
                ));
            }
            Some(StaffType::Teaching) => {
                if out.teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "teachingPositions",
                        "required",
                        "select at least one teaching position",
                    ));
                }
                if !out.non_teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "nonTeachingPositions",
                        "inconsistent",
                        "non-teaching positions conflict with staff type teaching",
                    ));
                }
            }
            Some(StaffType::NonTeaching) => {
                if out.non_teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "nonTeachingPositions",
                        "required",
                        "select at least one non-teaching position",
                    ));
                }
                if !out.teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "teachingPositions",
                        "inconsistent",
                        "teaching positions conflict with staff type non_teaching",
                    ));
                }
            }
            Some(StaffType::Both) => {
                if out.teaching_positions.is_empty() && out.non_teaching_positions.is_empty() {
                    errors.push(FieldError::new(
                        "teachingPositions",
                        "required",
                        "select at least one position from either set",
                    ));
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn
    }

    fn sender(role: Role, branch: Option<&str>) -> Sender {
        Sender {
            id: "sender-1".to_string(),
            role,
            branch_id: branch.map(|s| s.to_string()),
        }
    }

    fn seed_branch(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO branches(id, name) VALUES(?, ?)",
            (id, format!("branch-{}", id)),
        )
        .expect("insert branch");
    }

    fn seed_teaching_position(conn: &Connection, id: &str, class_teacher: bool) {
        conn.execute(
            "INSERT INTO teaching_positions(id, name, is_class_teacher) VALUES(?, ?, ?)",
            (id, format!("pos-{}", id), class_teacher as i64),
        )
        .expect("insert position");
    }

    #[test]
    fn no_role_clears_dependent_filters() {
        let conn = mem_conn();
        let spec = TargetSpec {
            branch: Some("b1".into()),
            role: None,
            staff_type: Some(StaffType::Teaching),
            teaching_positions: vec!["p1".into()],
            non_teaching_positions: vec!["n1".into()],
            student_class: Some("c1".into()),
            class_arm: Some("a1".into()),
        };
        let v = validate(&conn, &sender(Role::BranchAdmin, Some("b1")), &spec)
            .expect("idle spec is valid");
        assert!(v.role.is_none());
        assert!(v.staff_type.is_none());
        assert!(v.teaching_positions.is_empty());
        assert!(v.non_teaching_positions.is_empty());
        assert!(v.student_class.is_none());
        assert!(v.class_arm.is_none());
    }

    #[test]
    fn student_branch_is_overridden_not_validated() {
        let conn = mem_conn();
        let spec = TargetSpec {
            branch: Some("someone-elses-branch".into()),
            role: Some(Role::Parent),
            ..Default::default()
        };
        let v = validate(&conn, &sender(Role::Student, Some("own-branch")), &spec)
            .expect("valid");
        assert_eq!(v.branch.as_deref(), Some("own-branch"));
    }

    #[test]
    fn student_targeting_students_needs_class_and_arm() {
        let conn = mem_conn();
        let spec = TargetSpec {
            role: Some(Role::Student),
            student_class: Some("c1".into()),
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::Student, Some("b1")), &spec)
            .expect_err("missing arm must fail");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].field, "classArm");
        assert_eq!(errs[0].code, "required");
    }

    #[test]
    fn staff_like_sender_needs_branch() {
        let conn = mem_conn();
        let spec = TargetSpec {
            role: Some(Role::Student),
            ..Default::default()
        };
        let errs =
            validate(&conn, &sender(Role::BranchAdmin, None), &spec).expect_err("branch required");
        assert!(errs.iter().any(|e| e.field == "branch" && e.code == "required"));
    }

    #[test]
    fn staff_type_teaching_forbids_non_teaching_positions() {
        let conn = mem_conn();
        seed_branch(&conn, "b1");
        let spec = TargetSpec {
            branch: Some("b1".into()),
            role: Some(Role::Staff),
            staff_type: Some(StaffType::Teaching),
            teaching_positions: vec!["p1".into()],
            non_teaching_positions: vec!["n1".into()],
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::BranchAdmin, Some("b1")), &spec)
            .expect_err("mixed sets must fail");
        assert!(errs
            .iter()
            .any(|e| e.field == "nonTeachingPositions" && e.code == "inconsistent"));
    }

    #[test]
    fn positions_without_staff_type_fail() {
        let conn = mem_conn();
        let spec = TargetSpec {
            branch: Some("b1".into()),
            role: Some(Role::Staff),
            teaching_positions: vec!["p1".into()],
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::BranchAdmin, Some("b1")), &spec)
            .expect_err("staff type required");
        assert!(errs.iter().any(|e| e.field == "staffType"));
    }

    #[test]
    fn staff_type_without_positions_fails() {
        let conn = mem_conn();
        let spec = TargetSpec {
            branch: Some("b1".into()),
            role: Some(Role::Staff),
            staff_type: Some(StaffType::Both),
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::BranchAdmin, Some("b1")), &spec)
            .expect_err("positions required");
        assert!(errs.iter().any(|e| e.code == "required"));
    }

    #[test]
    fn parent_limited_to_class_teacher_positions() {
        let conn = mem_conn();
        seed_teaching_position(&conn, "ct", true);
        seed_teaching_position(&conn, "plain", false);

        let ok_spec = TargetSpec {
            role: Some(Role::Staff),
            teaching_positions: vec!["ct".into()],
            ..Default::default()
        };
        let v = validate(&conn, &sender(Role::Parent, Some("b1")), &ok_spec)
            .expect("class-teacher position accepted");
        // staff type is implied for parents.
        assert_eq!(v.staff_type, Some(StaffType::Teaching));

        let bad_spec = TargetSpec {
            role: Some(Role::Staff),
            teaching_positions: vec!["plain".into()],
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::Parent, Some("b1")), &bad_spec)
            .expect_err("plain position rejected");
        assert!(errs
            .iter()
            .any(|e| e.field == "teachingPositions" && e.code == "not_permitted"));
    }

    #[test]
    fn parent_may_not_target_superadmin() {
        let conn = mem_conn();
        let spec = TargetSpec {
            role: Some(Role::Superadmin),
            ..Default::default()
        };
        let errs = validate(&conn, &sender(Role::Parent, Some("b1")), &spec)
            .expect_err("role not permitted");
        assert!(errs.iter().any(|e| e.field == "role" && e.code == "not_permitted"));
    }
}
