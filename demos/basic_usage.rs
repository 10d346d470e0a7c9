// Example: entity sessions end to end
// Run with: cargo run --example basic_usage

use entitydb::{Entity, Registry, SessionFactory, Value};

fn main() -> anyhow::Result<()> {
    println!("=== EntityDB Basic Usage Example ===\n");

    let factory = SessionFactory::new(Registry::employee_department());
    let mut session = factory.open_session();

    // 1. Build an object graph: one department, two employees
    println!("1. Building the object graph...");
    let ann = Entity::new("Employee")
        .set("name", Value::text("Ann"))
        .set("salary", Value::float(82_000.0))
        .into_handle();
    let bob = Entity::new("Employee")
        .set("name", Value::text("Bob"))
        .set("salary", Value::float(54_000.0))
        .into_handle();
    let it = Entity::new("Department")
        .set("name", Value::text("IT"))
        .into_handle();

    // 2. Save only the department; the collection cascades, and the
    //    employee-side links may be wired after the save call
    println!("2. Saving the department (employees cascade)...");
    it.borrow_mut()
        .set_children("employees", vec![ann.clone(), bob.clone()]);
    session.save(&it)?;
    ann.borrow_mut().set_link("department", Some(it.clone()));
    bob.borrow_mut().set_link("department", Some(it.clone()));

    let txn = session.begin_transaction()?;
    session.commit(txn)?;
    println!(
        "   department key = {:?}, employee keys = {:?}, {:?}\n",
        it.borrow().key(),
        ann.borrow().key(),
        bob.borrow().key()
    );

    // 3. Query whole entities
    println!("3. All employees:");
    println!("{}", session.execute_query("FROM Employee")?.format());

    // 4. A join over the declared relationship
    println!("4. Names with department names:");
    println!(
        "{}",
        session
            .execute_query("SELECT e.name, d.name FROM Employee e JOIN e.department d")?
            .format()
    );

    // 5. An aggregate
    println!("5. Head count:");
    let count = session
        .execute_query("SELECT COUNT(e) FROM Employee e")?
        .unique_result()?;
    println!("   {} employees\n", count);

    // 6. A set-based raise, bypassing the object graph
    println!("6. Applying a 10% raise...");
    let raised = session.execute_update("update Employee e set e.salary = e.salary * 1.1")?;
    println!("   {} record(s) updated", raised);
    println!(
        "{}",
        session
            .execute_query("SELECT e.name, e.salary FROM Employee e")?
            .format()
    );

    // 7. Lazy-load the relationship back from the store
    println!("7. Walking Ann's department link...");
    let dept = session
        .load_link(&ann, "department")?
        .expect("Ann has a department");
    println!("   Ann works in {}\n", dept.borrow().get("name").unwrap_or(Value::Null));

    session.close();
    println!("=== Example Complete ===");
    Ok(())
}
