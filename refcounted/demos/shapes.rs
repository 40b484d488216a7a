use anyhow::Result;
use refcounted::{try_make_counted, upcast, IntrusivePtr, RefCount, RefCounted};
use std::{sync::Arc, thread};

// Any trait that extends RefCounted can be used behind an IntrusivePtr.
trait Shape: RefCounted + Send + Sync {
    fn name(&self) -> &'static str;
    fn area(&self) -> f64;

    /// Makes a fresh shape of the same kind, scaled by `factor`.
    fn scaled(&self, factor: f64) -> IntrusivePtr<dyn Shape>;
}

struct Circle {
    rc: RefCount,
    radius: f64,
}

// The counter has to be embedded in the object and returned from here.
unsafe impl RefCounted for Circle {
    fn ref_count(&self) -> &RefCount {
        &self.rc
    }
}

impl Shape for Circle {
    fn name(&self) -> &'static str {
        "circle"
    }

    fn area(&self) -> f64 {
        std::f64::consts::PI * self.radius * self.radius
    }

    fn scaled(&self, factor: f64) -> IntrusivePtr<dyn Shape> {
        let circle = IntrusivePtr::new(Self {
            rc: RefCount::new(),
            radius: self.radius * factor,
        });
        upcast!(circle => dyn Shape)
    }
}

impl Drop for Circle {
    fn drop(&mut self) {
        println!("circle of radius {} destroyed", self.radius);
    }
}

struct Rectangle {
    rc: RefCount,
    width: f64,
    height: f64,
}

unsafe impl RefCounted for Rectangle {
    fn ref_count(&self) -> &RefCount {
        &self.rc
    }
}

impl Shape for Rectangle {
    fn name(&self) -> &'static str {
        "rectangle"
    }

    fn area(&self) -> f64 {
        self.width * self.height
    }

    fn scaled(&self, factor: f64) -> IntrusivePtr<dyn Shape> {
        let rectangle = IntrusivePtr::new(Self {
            rc: RefCount::new(),
            width: self.width * factor,
            height: self.height * factor,
        });
        upcast!(rectangle => dyn Shape)
    }
}

impl Drop for Rectangle {
    fn drop(&mut self) {
        println!("{}x{} rectangle destroyed", self.width, self.height);
    }
}

fn main() -> Result<()> {
    // try_make_counted reports allocation failure instead of aborting.
    let circle = try_make_counted(Circle {
        rc: RefCount::new(),
        radius: 1.0,
    })?;
    let rectangle = try_make_counted(Rectangle {
        rc: RefCount::new(),
        width: 2.0,
        height: 3.0,
    })?;

    // Pointers to the concrete types can be turned into pointers to the
    // trait they implement. Both refer to the same object.
    let mut shapes: Vec<IntrusivePtr<dyn Shape>> = vec![
        upcast!(circle.clone() => dyn Shape),
        upcast!(rectangle => dyn Shape),
    ];
    assert!(shapes[0] == circle);
    assert_eq!(circle.use_count(), 2);
    drop(circle);

    // Calling through the trait creates objects of the concrete type.
    let bigger: Vec<_> = shapes.iter().map(|shape| shape.scaled(2.0)).collect();
    shapes.extend(bigger);

    // Pointers can be shared across threads. Whichever thread drops the last
    // pointer to a shape destroys it.
    let shapes = Arc::new(shapes);
    let threads: Vec<_> = (0..2)
        .map(|i| {
            let shapes = shapes.clone();
            thread::spawn(move || {
                let mine: Vec<_> = shapes.iter().skip(i).step_by(2).cloned().collect();
                mine.iter().map(|shape| shape.area()).sum::<f64>()
            })
        })
        .collect();
    let mut total = 0.0;
    for thread in threads {
        total += thread.join().unwrap();
    }

    for shape in shapes.iter() {
        println!("{} with area {:.2} (unique: {})", shape.name(), shape.area(), shape.unique());
    }
    println!("total area {total:.2}");
    Ok(())
}
