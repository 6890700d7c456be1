use std::collections::HashMap;

use anyhow::Context;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::models::{
    canonical_pair, AssignmentReport, FlaggedPair, SimilarityFact, StudentReportRow,
    StudentSemesterProfile,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const FACT_COLUMNS: &str = r#"
    SELECT f.id, f.assignment_id, f.submission_id_1, f.submission_id_2,
           f.percentage, f.match_id,
           s1.student_id AS student_id_1, s2.student_id AS student_id_2
    FROM integrity.similarity_facts f
    JOIN integrity.submissions s1 ON s1.id = f.submission_id_1
    JOIN integrity.submissions s2 ON s2.id = f.submission_id_2
"#;

fn fact_from_row(row: &sqlx::postgres::PgRow) -> SimilarityFact {
    SimilarityFact {
        id: row.get("id"),
        assignment_id: row.get("assignment_id"),
        submission_id_1: row.get("submission_id_1"),
        submission_id_2: row.get("submission_id_2"),
        student_id_1: row.get("student_id_1"),
        student_id_2: row.get("student_id_2"),
        percentage: row.get("percentage"),
        match_id: row.get("match_id"),
    }
}

/// All canonical similarity facts for one assignment, with student ids joined.
pub async fn fetch_assignment_facts(
    pool: &PgPool,
    assignment_id: Uuid,
) -> anyhow::Result<Vec<SimilarityFact>> {
    let query = format!(
        "{FACT_COLUMNS} WHERE f.assignment_id = $1 AND f.submission_id_1 < f.submission_id_2"
    );
    let rows = sqlx::query(&query)
        .bind(assignment_id)
        .fetch_all(pool)
        .await
        .context("fetch assignment similarity facts")?;

    Ok(rows.iter().map(fact_from_row).collect())
}

/// All canonical similarity facts across a course+semester scope.
pub async fn fetch_scope_facts(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
) -> anyhow::Result<Vec<SimilarityFact>> {
    let query = format!(
        r#"{FACT_COLUMNS}
        JOIN integrity.assignments a ON a.id = f.assignment_id
        WHERE a.course_id = $1 AND a.semester_id = $2
          AND f.submission_id_1 < f.submission_id_2"#
    );
    let rows = sqlx::query(&query)
        .bind(course_id)
        .bind(semester_id)
        .fetch_all(pool)
        .await
        .context("fetch scope similarity facts")?;

    Ok(rows.iter().map(fact_from_row).collect())
}

pub async fn fetch_assignment_ids(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
) -> anyhow::Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT id FROM integrity.assignments WHERE course_id = $1 AND semester_id = $2 ORDER BY id",
    )
    .bind(course_id)
    .bind(semester_id)
    .fetch_all(pool)
    .await
    .context("fetch assignment ids")?;

    Ok(rows.iter().map(|row| row.get("id")).collect())
}

/// The professor owning an assignment's flags, when one is recorded.
pub async fn professor_for_assignment(
    tx: &mut Transaction<'_, Postgres>,
    assignment_id: Uuid,
) -> anyhow::Result<Option<Uuid>> {
    let row = sqlx::query("SELECT professor_id FROM integrity.assignments WHERE id = $1")
        .bind(assignment_id)
        .fetch_optional(&mut **tx)
        .await
        .context("fetch assignment professor")?;

    Ok(row.and_then(|r| r.get::<Option<Uuid>, _>("professor_id")))
}

/// Submission id -> student id for one assignment.
pub async fn submission_students(
    tx: &mut Transaction<'_, Postgres>,
    assignment_id: Uuid,
) -> anyhow::Result<HashMap<Uuid, Uuid>> {
    let rows = sqlx::query(
        "SELECT id, student_id FROM integrity.submissions WHERE assignment_id = $1",
    )
    .bind(assignment_id)
    .fetch_all(&mut **tx)
    .await
    .context("fetch submission students")?;

    Ok(rows
        .iter()
        .map(|row| (row.get("id"), row.get("student_id")))
        .collect())
}

/// Most recent report for an assignment. There is at most one by
/// construction, but ordering by recency keeps reads correct even mid-rewrite.
pub async fn latest_report(
    pool: &PgPool,
    assignment_id: Uuid,
) -> anyhow::Result<Option<AssignmentReport>> {
    let row = sqlx::query(
        r#"
        SELECT id, assignment_id, mu, sigma, variance, created_at
        FROM integrity.assignment_reports
        WHERE assignment_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(assignment_id)
    .fetch_optional(pool)
    .await
    .context("fetch latest assignment report")?;

    Ok(row.map(|r| AssignmentReport {
        id: r.get("id"),
        assignment_id: r.get("assignment_id"),
        mu: r.get("mu"),
        sigma: r.get("sigma"),
        variance: r.get("variance"),
        created_at: r.get("created_at"),
    }))
}

/// Submission id -> z-score for one report, for standalone flagging runs.
pub async fn report_z_scores(
    pool: &PgPool,
    report_id: Uuid,
) -> anyhow::Result<HashMap<Uuid, f64>> {
    let rows = sqlx::query(
        "SELECT submission_id, z_score FROM integrity.student_reports WHERE report_id = $1",
    )
    .bind(report_id)
    .fetch_all(pool)
    .await
    .context("fetch report z-scores")?;

    Ok(rows
        .iter()
        .map(|row| (row.get("submission_id"), row.get("z_score")))
        .collect())
}

/// Per-submission z-scores and mean similarities for every current report in
/// a course+semester scope, keyed back to the owning student.
pub async fn fetch_scope_student_reports(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
) -> anyhow::Result<Vec<StudentReportRow>> {
    let rows = sqlx::query(
        r#"
        SELECT s.student_id, sr.z_score, sr.mean_similarity
        FROM integrity.student_reports sr
        JOIN integrity.submissions s ON s.id = sr.submission_id
        JOIN integrity.assignments a ON a.id = s.assignment_id
        WHERE a.course_id = $1 AND a.semester_id = $2
        ORDER BY s.student_id
        "#,
    )
    .bind(course_id)
    .bind(semester_id)
    .fetch_all(pool)
    .await
    .context("fetch scope student reports")?;

    Ok(rows
        .iter()
        .map(|row| StudentReportRow {
            student_id: row.get("student_id"),
            z_score: row.get("z_score"),
            mean_similarity: row.get("mean_similarity"),
        })
        .collect())
}

/// All semester profiles in scope, ordered by student id so clustering input
/// is stable across runs.
pub async fn fetch_profiles(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
) -> anyhow::Result<Vec<StudentSemesterProfile>> {
    let rows = sqlx::query(
        r#"
        SELECT student_id, avg_z_score, max_z_score, num_flagged_assignments,
               mean_similarity_variance, mean_similarity_skewness,
               mean_similarity_kurtosis, high_similarity_fraction, cluster_label
        FROM integrity.student_semester_profiles
        WHERE course_id = $1 AND semester_id = $2
        ORDER BY student_id
        "#,
    )
    .bind(course_id)
    .bind(semester_id)
    .fetch_all(pool)
    .await
    .context("fetch semester profiles")?;

    Ok(rows
        .iter()
        .map(|row| StudentSemesterProfile {
            student_id: row.get("student_id"),
            avg_z_score: row.get("avg_z_score"),
            max_z_score: row.get("max_z_score"),
            num_flagged_assignments: row.get("num_flagged_assignments"),
            mean_similarity_variance: row.get("mean_similarity_variance"),
            mean_similarity_skewness: row.get("mean_similarity_skewness"),
            mean_similarity_kurtosis: row.get("mean_similarity_kurtosis"),
            high_similarity_fraction: row.get("high_similarity_fraction"),
            cluster_label: row.get("cluster_label"),
        })
        .collect())
}

/// Flag evidence tuples reconstructed from persisted flags, for standalone
/// pair-stat rebuilds. Each flagged fact is joined against its assignment's
/// current report so the per-pair z uses the same mu/sigma the flagging run
/// saw.
pub async fn fetch_flag_evidence(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
) -> anyhow::Result<Vec<FlaggedPair>> {
    let rows = sqlx::query(
        r#"
        SELECT s1.student_id AS student_id_1, s2.student_id AS student_id_2,
               f.percentage, ar.mu, ar.sigma
        FROM integrity.flagged_students fl
        JOIN integrity.similarity_facts f ON f.id = fl.similarity_fact_id
        JOIN integrity.submissions s1 ON s1.id = f.submission_id_1
        JOIN integrity.submissions s2 ON s2.id = f.submission_id_2
        JOIN integrity.assignments a ON a.id = f.assignment_id
        JOIN integrity.assignment_reports ar ON ar.assignment_id = a.id
        WHERE a.course_id = $1 AND a.semester_id = $2
        "#,
    )
    .bind(course_id)
    .bind(semester_id)
    .fetch_all(pool)
    .await
    .context("fetch flag evidence")?;

    Ok(rows
        .iter()
        .map(|row| {
            let percentage: f64 = row.get("percentage");
            let mu: f64 = row.get("mu");
            let sigma: f64 = row.get("sigma");
            let z = if sigma != 0.0 {
                (percentage - mu) / sigma
            } else {
                0.0
            };
            FlaggedPair::new(
                row.get("student_id_1"),
                row.get("student_id_2"),
                percentage,
                z,
            )
        })
        .collect())
}

/// Load similarity facts from a CSV exported by the ingestion collaborator.
/// Rows carry enough context to upsert the assignment and both submissions;
/// pairs are normalized to canonical order and duplicates are dropped via
/// `ON CONFLICT DO NOTHING`. Returns the number of facts inserted.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        assignment_id: Uuid,
        course_id: Uuid,
        semester_id: Uuid,
        professor_id: Option<Uuid>,
        student_id_1: Uuid,
        submission_id_1: Uuid,
        student_id_2: Uuid,
        submission_id_2: Uuid,
        percentage: f64,
        match_id: i64,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed CSV record {}", line + 1))?;

        if !(0.0..=100.0).contains(&row.percentage) {
            anyhow::bail!(
                "record {}: similarity percentage {} outside [0, 100]",
                line + 1,
                row.percentage
            );
        }
        if row.submission_id_1 == row.submission_id_2 {
            tracing::warn!(record = line + 1, "self-pair skipped");
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO integrity.assignments (id, course_id, semester_id, professor_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(row.assignment_id)
        .bind(row.course_id)
        .bind(row.semester_id)
        .bind(row.professor_id)
        .execute(pool)
        .await?;

        for (submission_id, student_id) in [
            (row.submission_id_1, row.student_id_1),
            (row.submission_id_2, row.student_id_2),
        ] {
            sqlx::query(
                r#"
                INSERT INTO integrity.submissions (id, assignment_id, student_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(submission_id)
            .bind(row.assignment_id)
            .bind(student_id)
            .execute(pool)
            .await?;
        }

        // Canonical order: the smaller submission id always goes first.
        let (first, second) = canonical_pair(row.submission_id_1, row.submission_id_2);

        let result = sqlx::query(
            r#"
            INSERT INTO integrity.similarity_facts
            (id, assignment_id, submission_id_1, submission_id_2, percentage, match_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (assignment_id, submission_id_1, submission_id_2) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.assignment_id)
        .bind(first)
        .bind(second)
        .bind(row.percentage)
        .bind(row.match_id)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

/// Insert a small deterministic demo dataset: one course offering, three
/// students, two assignments, and canonical similarity facts with one clear
/// outlier pair.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let course_id = Uuid::parse_str("0b54a8f1-7c2e-4b4a-9a6e-2f1d3c5b7a90")?;
    let semester_id = Uuid::parse_str("6e1f9d2c-8a3b-4c5d-b7e6-0a1b2c3d4e5f")?;
    let professor_id = Uuid::parse_str("9c8b7a65-4d3e-2f10-8e9d-aabbccddeeff")?;

    let assignments = [
        Uuid::parse_str("11111111-1111-4111-8111-111111111111")?,
        Uuid::parse_str("22222222-2222-4222-8222-222222222222")?,
    ];
    let students = [
        Uuid::parse_str("aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa")?,
        Uuid::parse_str("bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb")?,
        Uuid::parse_str("cccccccc-cccc-4ccc-8ccc-cccccccccccc")?,
    ];

    for (i, assignment_id) in assignments.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO integrity.assignments (id, course_id, semester_id, professor_id, title)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(assignment_id)
        .bind(course_id)
        .bind(semester_id)
        .bind(professor_id)
        .bind(format!("Assignment {}", i + 1))
        .execute(pool)
        .await?;
    }

    // Submission ids are derived per (assignment, student) so reseeding is
    // idempotent.
    let submission =
        |a: usize, s: usize| Uuid::from_u128(((a as u128 + 1) << 64) | (s as u128 + 1));

    for (a, assignment_id) in assignments.iter().enumerate() {
        for (s, student_id) in students.iter().enumerate() {
            let id = submission(a, s);
            sqlx::query(
                r#"
                INSERT INTO integrity.submissions (id, assignment_id, student_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(id)
            .bind(assignment_id)
            .bind(student_id)
            .execute(pool)
            .await?;
        }
    }

    // (assignment index, student index pair, similarity). Students 0 and 1
    // share a suspiciously similar pair on both assignments.
    let facts: [(usize, usize, usize, f64); 6] = [
        (0, 0, 1, 88.0),
        (0, 0, 2, 22.0),
        (0, 1, 2, 18.0),
        (1, 0, 1, 91.0),
        (1, 0, 2, 15.0),
        (1, 1, 2, 25.0),
    ];

    for (i, (a, s1, s2, pct)) in facts.iter().enumerate() {
        let (sub_1, sub_2) = canonical_pair(submission(*a, *s1), submission(*a, *s2));
        sqlx::query(
            r#"
            INSERT INTO integrity.similarity_facts
            (id, assignment_id, submission_id_1, submission_id_2, percentage, match_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (assignment_id, submission_id_1, submission_id_2) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(assignments[*a])
        .bind(sub_1)
        .bind(sub_2)
        .bind(*pct)
        .bind(i as i64 + 1)
        .execute(pool)
        .await?;
    }

    Ok(())
}
