use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::db;
use crate::error::AnalysisError;
use crate::models::{AssignmentReport, FlaggedPair, SimilarityFact};
use crate::stats;

/// What one assignment's report run produced.
#[derive(Debug)]
pub struct ReportOutcome {
    pub report: AssignmentReport,
    pub students: usize,
    pub flags_created: u64,
    /// Evidence tuples for the semester-wide pair-stat rebuild.
    pub flagged_pairs: Vec<FlaggedPair>,
}

/// Totals for a whole course+semester batch.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub assignments: usize,
    pub reports: usize,
    pub skipped: usize,
    pub flags_created: u64,
    pub pair_rows: usize,
}

/// Compute and persist one assignment's statistical report, replacing any
/// previous report and flagging outliers, all in a single transaction.
///
/// Sequence: aggregate facts, compute population stats, insert the
/// AssignmentReport, bulk-insert per-submission StudentReports, delete every
/// superseded report (StudentReports cascade), then flag students over the
/// cutoff under the assignment's professor. A failure at any step rolls the
/// whole transaction back, leaving the previous report intact.
pub async fn generate_report(
    pool: &PgPool,
    assignment_id: Uuid,
    cutoff: f64,
) -> anyhow::Result<ReportOutcome> {
    let facts = db::fetch_assignment_facts(pool, assignment_id).await?;
    let scores = stats::scores_by_submission(&facts);
    let (mu, sigma) = stats::population_stats(&scores)?;
    let variance = sigma * sigma;
    let total_pairs = scores.values().map(Vec::len).sum::<usize>() / 2;

    tracing::debug!(
        assignment = %assignment_id,
        submissions = scores.len(),
        pairs = total_pairs,
        mu,
        sigma,
        "computed population statistics"
    );

    let mut tx = pool.begin().await.context("begin report transaction")?;

    let report_id = Uuid::new_v4();
    let created_at: DateTime<Utc> = sqlx::query(
        r#"
        INSERT INTO integrity.assignment_reports (id, assignment_id, mu, sigma, variance)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING created_at
        "#,
    )
    .bind(report_id)
    .bind(assignment_id)
    .bind(mu)
    .bind(sigma)
    .bind(variance)
    .fetch_one(&mut *tx)
    .await?
    .get("created_at");

    // Student id per submission, and z per submission for the flagging pass.
    let students = db::submission_students(&mut tx, assignment_id).await?;
    let mut z_by_submission: HashMap<Uuid, f64> = HashMap::new();

    for (submission_id, sims) in &scores {
        let (mean_sim, z) = stats::student_z_score(sims, mu, sigma, Some(total_pairs))?;
        let (ci_lower, ci_upper) =
            stats::student_confidence_interval(sims, sigma, 0.95, Some(total_pairs))?;
        z_by_submission.insert(*submission_id, z);

        sqlx::query(
            r#"
            INSERT INTO integrity.student_reports
            (id, report_id, submission_id, mean_similarity, z_score, ci_lower, ci_upper)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(submission_id)
        .bind(mean_sim)
        .bind(z)
        .bind(ci_lower)
        .bind(ci_upper)
        .execute(&mut *tx)
        .await?;
    }

    // Retire superseded reports; their student reports cascade away.
    sqlx::query("DELETE FROM integrity.assignment_reports WHERE assignment_id = $1 AND id <> $2")
        .bind(assignment_id)
        .bind(report_id)
        .execute(&mut *tx)
        .await?;

    let (flags_created, flagged_pairs) =
        match db::professor_for_assignment(&mut tx, assignment_id).await? {
            Some(professor_id) => {
                flag_in_tx(
                    &mut tx,
                    assignment_id,
                    professor_id,
                    cutoff,
                    mu,
                    sigma,
                    &facts,
                    &students,
                    &z_by_submission,
                )
                .await?
            }
            None => {
                tracing::warn!(
                    assignment = %assignment_id,
                    "{}; report kept, flagging skipped",
                    AnalysisError::MissingProfessorContext
                );
                (0, Vec::new())
            }
        };

    tx.commit().await.context("commit report transaction")?;

    tracing::info!(
        assignment = %assignment_id,
        students = scores.len(),
        flags = flags_created,
        "report generated"
    );

    Ok(ReportOutcome {
        report: AssignmentReport {
            id: report_id,
            assignment_id,
            mu,
            sigma,
            variance,
            created_at,
        },
        students: scores.len(),
        flags_created,
        flagged_pairs,
    })
}

/// Flag every similarity pair implicating a student whose z-score exceeds the
/// cutoff. When suspects exist, prior flags for the same professor+assignment
/// are cleared before inserting so re-runs with a different cutoff never
/// accumulate duplicates; insertion ignores unique-constraint conflicts from
/// concurrent paths. No suspects means no writes at all. Returns the number of
/// rows inserted plus the evidence tuples for pair-stat rebuilds.
#[allow(clippy::too_many_arguments)]
async fn flag_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    assignment_id: Uuid,
    professor_id: Uuid,
    cutoff: f64,
    mu: f64,
    sigma: f64,
    facts: &[SimilarityFact],
    students: &HashMap<Uuid, Uuid>,
    z_by_submission: &HashMap<Uuid, f64>,
) -> anyhow::Result<(u64, Vec<FlaggedPair>)> {
    let suspects: Vec<Uuid> = z_by_submission
        .iter()
        .filter(|(_, z)| **z > cutoff)
        .map(|(submission_id, _)| *submission_id)
        .collect();
    if suspects.is_empty() {
        return Ok((0, Vec::new()));
    }

    sqlx::query(
        r#"
        DELETE FROM integrity.flagged_students
        WHERE professor_id = $1
          AND similarity_fact_id IN
            (SELECT id FROM integrity.similarity_facts WHERE assignment_id = $2)
        "#,
    )
    .bind(professor_id)
    .bind(assignment_id)
    .execute(&mut **tx)
    .await?;

    let mut by_submission: HashMap<Uuid, Vec<&SimilarityFact>> = HashMap::new();
    for fact in facts {
        by_submission
            .entry(fact.submission_id_1)
            .or_default()
            .push(fact);
        by_submission
            .entry(fact.submission_id_2)
            .or_default()
            .push(fact);
    }

    let mut created = 0u64;
    let mut flagged_pairs = Vec::new();

    for submission_id in suspects {
        let Some(student_id) = students.get(&submission_id) else {
            continue;
        };
        for fact in by_submission.get(&submission_id).into_iter().flatten() {
            let result = sqlx::query(
                r#"
                INSERT INTO integrity.flagged_students
                (id, professor_id, student_id, similarity_fact_id, generative_ai)
                VALUES ($1, $2, $3, $4, FALSE)
                ON CONFLICT (student_id, similarity_fact_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(professor_id)
            .bind(student_id)
            .bind(fact.id)
            .execute(&mut **tx)
            .await?;
            created += result.rows_affected();

            let z = if sigma != 0.0 {
                (fact.percentage - mu) / sigma
            } else {
                0.0
            };
            flagged_pairs.push(FlaggedPair::new(
                fact.student_id_1,
                fact.student_id_2,
                fact.percentage,
                z,
            ));
        }
    }

    Ok((created, flagged_pairs))
}

/// Standalone flagging against an assignment's most recent report, in its own
/// transaction. Lets a professor re-run with a different cutoff without
/// recomputing the report.
pub async fn flag_student_pairs(
    pool: &PgPool,
    assignment_id: Uuid,
    professor_id: Uuid,
    cutoff: f64,
) -> anyhow::Result<u64> {
    let report = db::latest_report(pool, assignment_id)
        .await?
        .with_context(|| format!("no report exists for assignment {assignment_id}"))?;

    let facts = db::fetch_assignment_facts(pool, assignment_id).await?;
    let z_by_submission = db::report_z_scores(pool, report.id).await?;

    let mut tx = pool.begin().await.context("begin flagging transaction")?;
    let students = db::submission_students(&mut tx, assignment_id).await?;
    let (created, _) = flag_in_tx(
        &mut tx,
        assignment_id,
        professor_id,
        cutoff,
        report.mu,
        report.sigma,
        &facts,
        &students,
        &z_by_submission,
    )
    .await?;
    tx.commit().await.context("commit flagging transaction")?;

    tracing::info!(
        assignment = %assignment_id,
        professor = %professor_id,
        cutoff,
        flags = created,
        "flagging pass complete"
    );

    Ok(created)
}

/// Generate reports for every assignment in a course+semester on a bounded
/// worker pool, then rebuild pair stats from the collected flag evidence.
///
/// Assignments are independent (no shared rows), so one worker per assignment
/// up to `workers` permits. An assignment with no similarity facts is logged
/// and skipped; any other failure is reported without aborting siblings.
pub async fn generate_for_course_semester(
    pool: &PgPool,
    course_id: Uuid,
    semester_id: Uuid,
    cutoff: f64,
    workers: usize,
) -> anyhow::Result<BatchSummary> {
    let assignment_ids = db::fetch_assignment_ids(pool, course_id, semester_id).await?;
    let mut summary = BatchSummary {
        assignments: assignment_ids.len(),
        ..BatchSummary::default()
    };
    if assignment_ids.is_empty() {
        tracing::info!(course = %course_id, semester = %semester_id, "no assignments in scope");
        return Ok(summary);
    }

    tracing::info!(
        course = %course_id,
        semester = %semester_id,
        assignments = assignment_ids.len(),
        workers,
        "dispatching report generation"
    );

    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();
    for assignment_id in assignment_ids {
        let pool = pool.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("worker semaphore closed")?;
            let outcome = generate_report(&pool, assignment_id, cutoff).await;
            Ok::<_, anyhow::Error>((assignment_id, outcome))
        });
    }

    let mut flagged = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (assignment_id, outcome) = joined.context("report worker panicked")??;
        match outcome {
            Ok(outcome) => {
                summary.reports += 1;
                summary.flags_created += outcome.flags_created;
                flagged.extend(outcome.flagged_pairs);
            }
            Err(err)
                if err.downcast_ref::<AnalysisError>()
                    == Some(&AnalysisError::EmptyPopulation) =>
            {
                summary.skipped += 1;
                tracing::warn!(assignment = %assignment_id, "no similarity facts; skipped");
            }
            Err(err) => {
                summary.skipped += 1;
                tracing::warn!(assignment = %assignment_id, error = %err, "report failed");
            }
        }
    }

    // Pair stats run only after every surviving report is committed. A skipped
    // assignment keeps its previously committed flags, which this run never
    // saw, so the evidence is re-read from the database in that case; for a
    // clean batch the persisted set and the in-memory set are identical.
    let flagged = if summary.skipped > 0 {
        db::fetch_flag_evidence(pool, course_id, semester_id).await?
    } else {
        flagged
    };
    let facts = db::fetch_scope_facts(pool, course_id, semester_id).await?;
    summary.pair_rows =
        crate::pairs::rebuild_pair_stats(pool, course_id, semester_id, &facts, &flagged).await?;

    Ok(summary)
}
