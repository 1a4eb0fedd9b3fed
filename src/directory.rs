use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Account roles. `staff_like` roles are the ones that may carry a staff
/// type and position assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Superadmin,
    BranchAdmin,
    Staff,
    Student,
    Parent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "superadmin" => Some(Role::Superadmin),
            "branch_admin" => Some(Role::BranchAdmin),
            "staff" => Some(Role::Staff),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::BranchAdmin => "branch_admin",
            Role::Staff => "staff",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }

    pub fn is_staff_like(self) -> bool {
        matches!(self, Role::Superadmin | Role::BranchAdmin | Role::Staff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffType {
    Teaching,
    NonTeaching,
    Both,
}

impl StaffType {
    pub fn parse(s: &str) -> Option<StaffType> {
        match s {
            "teaching" => Some(StaffType::Teaching),
            "non_teaching" => Some(StaffType::NonTeaching),
            "both" => Some(StaffType::Both),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StaffType::Teaching => "teaching",
            StaffType::NonTeaching => "non_teaching",
            StaffType::Both => "both",
        }
    }

    /// Account staff_type values that satisfy a request for this staff type.
    /// An account marked `both` answers for either single-sided request.
    pub fn matching_account_types(self) -> &'static [&'static str] {
        match self {
            StaffType::Teaching => &["teaching", "both"],
            StaffType::NonTeaching => &["non_teaching", "both"],
            StaffType::Both => &["teaching", "non_teaching", "both"],
        }
    }
}

/// Which position table a primary-position reference points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    Teaching,
    NonTeaching,
}

impl PositionKind {
    pub fn parse(s: &str) -> Option<PositionKind> {
        match s {
            "teaching" => Some(PositionKind::Teaching),
            "non_teaching" => Some(PositionKind::NonTeaching),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PositionKind::Teaching => "teaching",
            PositionKind::NonTeaching => "non_teaching",
        }
    }
}

/// The identity every validation and resolution call is made on behalf of.
#[derive(Debug, Clone)]
pub struct Sender {
    pub id: String,
    pub role: Role,
    pub branch_id: Option<String>,
}

pub fn load_sender(conn: &Connection, account_id: &str) -> anyhow::Result<Option<Sender>> {
    let row = conn
        .query_row(
            "SELECT id, role, branch_id FROM accounts WHERE id = ? AND is_active = 1",
            [account_id],
            |r| {
                let id: String = r.get(0)?;
                let role: String = r.get(1)?;
                let branch_id: Option<String> = r.get(2)?;
                Ok((id, role, branch_id))
            },
        )
        .optional()?;
    let Some((id, role_raw, branch_id)) = row else {
        return Ok(None);
    };
    let Some(role) = Role::parse(&role_raw) else {
        anyhow::bail!("account {} has unknown role {}", id, role_raw);
    };
    Ok(Some(Sender {
        id,
        role,
        branch_id,
    }))
}

/// Resolver output row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecipientAccount {
    pub id: String,
    pub username: String,
    pub email: String,
    pub branch_id: Option<String>,
}

/// (class, arm) pairs of a parent's active children. Arm may be unset when a
/// student has not yet been placed in an arm.
pub fn children_class_pairs(
    conn: &Connection,
    parent_account_id: &str,
) -> anyhow::Result<Vec<(String, Option<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT sp.current_class_id, sp.current_class_arm_id
         FROM student_profiles sp
         JOIN accounts a ON a.id = sp.account_id
         WHERE sp.parent_account_id = ? AND a.is_active = 1",
    )?;
    let pairs = stmt
        .query_map([parent_account_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pairs)
}

/// The parent account linked to a student's profile, if the student has one.
pub fn parent_of_student(
    conn: &Connection,
    student_account_id: &str,
) -> anyhow::Result<Option<String>> {
    let parent = conn
        .query_row(
            "SELECT parent_account_id FROM student_profiles WHERE account_id = ?",
            [student_account_id],
            |r| r.get::<_, String>(0),
        )
        .optional()?;
    Ok(parent)
}

pub fn account_with_email_exists(conn: &Connection, email: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM accounts WHERE lower(email) = lower(?)",
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// True when any of the given teaching position ids is flagged class-teacher.
pub fn any_class_teacher_position(conn: &Connection, ids: &[String]) -> anyhow::Result<bool> {
    for id in ids {
        let flagged: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM teaching_positions WHERE id = ? AND is_class_teacher = 1",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        if flagged.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Teaching position ids from the given set that are NOT class-teacher
/// flagged. Used by target validation for parent senders.
pub fn non_class_teacher_positions(
    conn: &Connection,
    ids: &[String],
) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    for id in ids {
        let flagged: Option<i64> = conn
            .query_row(
                "SELECT is_class_teacher FROM teaching_positions WHERE id = ?",
                [id],
                |r| r.get(0),
            )
            .optional()?;
        if flagged.unwrap_or(0) == 0 {
            out.push(id.clone());
        }
    }
    Ok(out)
}
