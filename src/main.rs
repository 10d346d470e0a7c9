// Main entry point for the EntityDB CLI
// Provides an interactive shell for HQL queries plus a scripted demo of the
// session workflow (cascade save, queries, bulk mutations).

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use entitydb::query::parser::Statement;
use entitydb::{Entity, QueryBuilder, Registry, SessionFactory, Value};
use std::io::{self, Write};
use std::path::PathBuf;

/// EntityDB - an in-memory entity engine with unit-of-work sessions
#[derive(ClapParser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Load entity definitions from a JSON schema file instead of the
    /// built-in Employee/Department schema
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Execute a single HQL statement and exit
    #[arg(short, long)]
    execute: Option<String>,

    /// Run the scripted session walkthrough and exit
    #[arg(short, long)]
    demo: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let registry = match &args.schema {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read schema file {}", path.display()))?;
            Registry::from_json(&json)?
        }
        None => Registry::employee_department(),
    };
    let factory = SessionFactory::new(registry);

    if args.demo {
        return run_demo(&factory);
    }

    // The built-in schema comes pre-seeded so queries have something to chew on
    if args.schema.is_none() {
        seed(&factory)?;
    }

    let mut session = factory.open_session();
    if let Some(hql) = args.execute {
        let result = execute_statement(&session, &hql);
        session.close();
        return result;
    }

    println!("╔════════════════════════════════════════════╗");
    println!("║        EntityDB Interactive Shell          ║");
    println!("║   Entities, sessions and HQL queries       ║");
    println!("╚════════════════════════════════════════════╝");
    println!();
    println!("Type HQL statements or '.help' for help");
    println!("Type '.exit' to quit");
    println!();

    let result = repl(&factory, &session);
    session.close();
    result
}

/// Interactive read-eval-print loop.
fn repl(factory: &SessionFactory, session: &entitydb::Session) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("entitydb> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break; // EOF
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('.') {
            match input {
                ".exit" | ".quit" => {
                    println!("Goodbye!");
                    break;
                }
                ".help" => {
                    print_help();
                    continue;
                }
                ".tables" => {
                    print_tables(factory)?;
                    continue;
                }
                _ => {
                    println!("Unknown command: {}", input);
                    println!("Type '.help' for help");
                    continue;
                }
            }
        }

        if let Err(e) = execute_statement(session, input) {
            eprintln!("Error: {}", e);
        }
    }
    Ok(())
}

/// Parse one HQL statement and dispatch it: selects print a result table,
/// mutations print the affected count.
fn execute_statement(session: &entitydb::Session, hql: &str) -> Result<()> {
    let built = {
        let registry = session_registry(session);
        QueryBuilder::new(&registry).build(hql)?
    };
    match built {
        Statement::Select(query) => {
            let output = session.select(&query)?;
            println!("{}", output.format());
        }
        Statement::Update(_) | Statement::Delete(_) => {
            let affected = session.execute_update(hql)?;
            println!("{} record(s) affected", affected);
        }
    }
    Ok(())
}

fn session_registry(session: &entitydb::Session) -> std::sync::Arc<Registry> {
    session.registry().clone()
}

/// Seed the built-in schema with the sample data the demo uses.
fn seed(factory: &SessionFactory) -> Result<()> {
    let mut session = factory.open_session();

    let it = Entity::new("Department")
        .set("name", Value::text("IT"))
        .into_handle();
    let hr = Entity::new("Department")
        .set("name", Value::text("HR"))
        .into_handle();

    let employees = [
        ("Rohit", 98_500.0, Some(&it)),
        ("Pavan", 45_500.0, Some(&it)),
        ("Kiran", 68_000.0, Some(&hr)),
        ("Asha", 25_000.0, None),
    ];
    let mut handles = Vec::new();
    for (name, salary, dept) in employees {
        let emp = Entity::new("Employee")
            .set("name", Value::text(name))
            .set("salary", Value::float(salary))
            .into_handle();
        if let Some(dept) = dept {
            emp.borrow_mut().set_link("department", Some(dept.clone()));
        }
        handles.push((emp, dept.cloned()));
    }
    it.borrow_mut().set_children(
        "employees",
        handles
            .iter()
            .filter(|(_, d)| d.as_ref().map(|d| std::rc::Rc::ptr_eq(d, &it)) == Some(true))
            .map(|(e, _)| e.clone())
            .collect(),
    );
    hr.borrow_mut().set_children(
        "employees",
        handles
            .iter()
            .filter(|(_, d)| d.as_ref().map(|d| std::rc::Rc::ptr_eq(d, &hr)) == Some(true))
            .map(|(e, _)| e.clone())
            .collect(),
    );

    session.save(&it)?;
    session.save(&hr)?;
    for (emp, dept) in &handles {
        if dept.is_none() {
            session.save(emp)?;
        }
    }

    let txn = session.begin_transaction()?;
    session.commit(txn)?;
    session.close();
    Ok(())
}

/// The scripted walkthrough: cascade save, a tour of the query language,
/// then set-based mutations.
fn run_demo(factory: &SessionFactory) -> Result<()> {
    println!("=== Cascade save ===");
    let mut session = factory.open_session();

    let rohit = Entity::new("Employee")
        .set("name", Value::text("Rohit"))
        .set("salary", Value::float(98_500.0))
        .into_handle();
    let pavan = Entity::new("Employee")
        .set("name", Value::text("Pavan"))
        .set("salary", Value::float(45_500.0))
        .into_handle();
    let kiran = Entity::new("Employee")
        .set("name", Value::text("Kiran"))
        .set("salary", Value::float(68_000.0))
        .into_handle();
    let it = Entity::new("Department")
        .set("name", Value::text("IT"))
        .into_handle();
    let hr = Entity::new("Department")
        .set("name", Value::text("HR"))
        .into_handle();

    // Save only the departments; the employee collections cascade, and the
    // back-references are wired after the save call
    it.borrow_mut()
        .set_children("employees", vec![rohit.clone(), pavan.clone()]);
    hr.borrow_mut().set_children("employees", vec![kiran.clone()]);
    session.save(&it)?;
    session.save(&hr)?;
    rohit.borrow_mut().set_link("department", Some(it.clone()));
    pavan.borrow_mut().set_link("department", Some(it.clone()));
    kiran.borrow_mut().set_link("department", Some(hr.clone()));

    let txn = session.begin_transaction()?;
    session.commit(txn)?;
    println!(
        "Saved departments {:?}/{:?} and 3 employees",
        it.borrow().key(),
        hr.borrow().key()
    );

    // A department-less employee for the later queries
    let solo = Entity::new("Employee")
        .set("name", Value::text("Asha"))
        .set("salary", Value::float(25_000.0))
        .into_handle();
    session.save(&solo)?;
    let txn = session.begin_transaction()?;
    session.commit(txn)?;

    println!("\n=== All employees ===");
    show(&session, "FROM Employee")?;

    println!("=== Names and departments (inner join) ===");
    show(
        &session,
        "SELECT e.name, d.name FROM Employee e JOIN e.department d",
    )?;

    println!("=== Head count ===");
    show(&session, "SELECT COUNT(e) FROM Employee e")?;

    println!("=== Head count per department ===");
    show(
        &session,
        "SELECT d.name, COUNT(e) FROM Employee e JOIN e.department d GROUP BY d.name",
    )?;

    println!("=== Salary bands ===");
    show(
        &session,
        "SELECT e.name, \
         CASE WHEN e.salary > 70000 THEN 'High' \
              WHEN e.salary BETWEEN 50000 AND 70000 THEN 'Medium' \
              ELSE 'Low' END \
         FROM Employee e",
    )?;

    println!("=== Employees outside every department ===");
    show(
        &session,
        "SELECT e FROM Employee e \
         WHERE NOT EXISTS (SELECT d FROM Department d WHERE d = e.department)",
    )?;

    println!("=== Page 1 of 2 ===");
    let paged = session.build_query("FROM Employee")?.page(1, 2)?;
    println!("{}", session.select(&paged)?.format());

    println!("=== Correcting one salary (id = 2) ===");
    let changed = session.execute_update("update Employee e set e.salary = 47000 where id = 2")?;
    println!("{} record(s) updated", changed);
    show(&session, "SELECT e.name, e.salary FROM Employee e WHERE id = 2")?;

    println!("=== One resignation (id = 2) ===");
    let gone = session.execute_update("delete Employee where id = 2")?;
    println!("{} record(s) deleted", gone);

    println!("=== 10% raise for everyone ===");
    let raised = session.execute_update("update Employee e set e.salary = e.salary * 1.1")?;
    println!("{} record(s) updated", raised);
    show(&session, "SELECT e.name, e.salary FROM Employee e")?;

    println!("=== Letting low earners go ===");
    let removed = session.execute_update("delete Employee e where e.salary < 30000")?;
    println!("{} record(s) deleted", removed);
    show(&session, "FROM Employee")?;

    // Close twice, like a finally block running after a normal close
    session.close();
    session.close();
    println!("Session closed");
    Ok(())
}

fn show(session: &entitydb::Session, hql: &str) -> Result<()> {
    println!("{}", session.execute_query(hql)?.format());
    Ok(())
}

fn print_tables(factory: &SessionFactory) -> Result<()> {
    let store = factory
        .store()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    for name in factory.registry().entity_names() {
        println!("{}: {} record(s)", name, store.count(name)?);
    }
    Ok(())
}

fn print_help() {
    println!("Special commands:");
    println!("  .help              Show this help message");
    println!("  .tables            List entity types and record counts");
    println!("  .exit, .quit       Exit the shell");
    println!();
    println!("HQL statements:");
    println!("  FROM Employee");
    println!("  SELECT e.name, d.name FROM Employee e JOIN e.department d");
    println!("  SELECT COUNT(e) FROM Employee e");
    println!("  SELECT d.name, COUNT(e) FROM Employee e JOIN e.department d GROUP BY d.name");
    println!("  SELECT e.name, CASE WHEN e.salary > 70000 THEN 'High' ELSE 'Low' END FROM Employee e");
    println!("  update Employee e set e.salary = e.salary * 1.1");
    println!("  delete Employee e where e.salary < 30000");
    println!();
    println!("Notes:");
    println!("  - Keywords are case-insensitive; strings use single quotes");
    println!("  - Results come back in surrogate-key order");
}
